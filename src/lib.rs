//! Hierarchical data maintenance for SeaORM entities.
//!
//! A model opts into a tree encoding (nested set, closure table or
//! materialized path) through `#[derive(TreeModel)]`. Writes go through a
//! [`UnitOfWork`], whose flush calls the configured strategy's hooks so the
//! encoding stays consistent with the parent references; reads go through a
//! [`TreeRepository`].

pub mod batch;
pub mod change_set;
pub mod config;
pub mod error;
pub mod lock;
mod query;
pub mod repository;
pub mod strategy;
pub mod traits;
pub mod unit_of_work;
pub mod value;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{
        AdvisoryLockStrategy, DependentBehavior, OrderStrategy, StrategyKind, TreeConfig,
        TreeOptions,
    };
    pub use crate::repository::TreeRepository;
    pub use crate::traits::TreeModel;
    pub use crate::unit_of_work::{FlushOutcome, PendingNode, UnitOfWork};
}

pub use batch::BatchContext;
pub use change_set::{ChangeSet, FieldChange};
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, ClosureFields, DependentBehavior, NestedSetFields,
    OrderStrategy, PathFields, StrategyKind, TreeConfig, TreeLayout, TreeOptions,
};
pub use error::{ConfigError, TreeError};
pub use repository::{TreeRepository, VerificationIssue};
pub use strategy::{Strategy, TreeStrategy};
pub use traits::{resolve_metadata, TreeModel};
pub use tree_behavior_macros::TreeModel;
pub use unit_of_work::{FlushOutcome, PendingNode, UnitOfWork};

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;

    pub use crate::value::{convert, TreeFieldType};
}
