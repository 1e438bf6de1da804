//! Lifecycle hooks keeping each tree encoding consistent during a flush.

pub mod closure;
pub mod interval;
pub mod materialized_path;
pub mod nested_set;

use async_trait::async_trait;
use sea_orm::ConnectionTrait;

use crate::batch::BatchContext;
use crate::change_set::ChangeSet;
use crate::config::{StrategyKind, TreeConfig, TreeLayout};
use crate::error::TreeError;
use crate::traits::TreeModel;

pub use closure::ClosureTable;
pub use interval::{Direction, IntervalSynchronizer, ShiftCondition, ShiftField, Subtree};
pub use materialized_path::MaterializedPath;
pub use nested_set::NestedSet;

/// Hooks invoked by [`crate::UnitOfWork`] while flushing.
///
/// All hooks receive the flush's connection (normally a transaction) and
/// the batch context; none of them keep state between flushes. Callers must
/// serialise structural writers per tree, see [`crate::lock`].
#[async_trait]
pub trait TreeStrategy<M: TreeModel>: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Before the row is written. `parent` is the resolved parent id.
    async fn pre_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        active: &mut M::ActiveModel,
        parent: Option<&M::Id>,
    ) -> Result<(), TreeError>;

    /// Right after the row is written.
    async fn post_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError>;

    /// Once every insert of the flush has been written.
    async fn process_pending<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
    ) -> Result<(), TreeError> {
        let _ = (conn, batch);
        Ok(())
    }

    /// After an updated row is written. `node` is the stored state before
    /// the update.
    async fn scheduled_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
        changes: &ChangeSet,
    ) -> Result<(), TreeError>;

    /// Before the row is deleted.
    async fn scheduled_delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError>;

    async fn flush_end<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: BatchContext<M>,
    ) -> Result<(), TreeError> {
        let _ = conn;
        batch.finish()
    }
}

/// The strategy configured for a model.
#[derive(Clone, Copy, Debug)]
pub enum Strategy<'c> {
    NestedSet(NestedSet<'c>),
    Closure(ClosureTable<'c>),
    MaterializedPath(MaterializedPath<'c>),
}

impl<'c> Strategy<'c> {
    pub fn for_config(config: &'c TreeConfig) -> Self {
        match config.layout() {
            TreeLayout::NestedSet(fields) => Strategy::NestedSet(NestedSet::new(config, fields)),
            TreeLayout::Closure(fields) => Strategy::Closure(ClosureTable::new(config, fields)),
            TreeLayout::MaterializedPath(fields) => {
                Strategy::MaterializedPath(MaterializedPath::new(config, fields))
            }
        }
    }
}

#[async_trait]
impl<'c, M: TreeModel> TreeStrategy<M> for Strategy<'c> {
    fn kind(&self) -> StrategyKind {
        match self {
            Strategy::NestedSet(_) => StrategyKind::NestedSet,
            Strategy::Closure(_) => StrategyKind::Closure,
            Strategy::MaterializedPath(_) => StrategyKind::MaterializedPath,
        }
    }

    async fn pre_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        active: &mut M::ActiveModel,
        parent: Option<&M::Id>,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => s.pre_insert(conn, batch, active, parent).await,
            Strategy::Closure(s) => s.pre_insert(conn, batch, active, parent).await,
            Strategy::MaterializedPath(s) => s.pre_insert(conn, batch, active, parent).await,
        }
    }

    async fn post_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => s.post_insert(conn, batch, node).await,
            Strategy::Closure(s) => s.post_insert(conn, batch, node).await,
            Strategy::MaterializedPath(s) => s.post_insert(conn, batch, node).await,
        }
    }

    async fn process_pending<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => TreeStrategy::<M>::process_pending(s, conn, batch).await,
            Strategy::Closure(s) => TreeStrategy::<M>::process_pending(s, conn, batch).await,
            Strategy::MaterializedPath(s) => {
                TreeStrategy::<M>::process_pending(s, conn, batch).await
            }
        }
    }

    async fn scheduled_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
        changes: &ChangeSet,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => s.scheduled_update(conn, batch, node, changes).await,
            Strategy::Closure(s) => s.scheduled_update(conn, batch, node, changes).await,
            Strategy::MaterializedPath(s) => s.scheduled_update(conn, batch, node, changes).await,
        }
    }

    async fn scheduled_delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => s.scheduled_delete(conn, batch, node).await,
            Strategy::Closure(s) => s.scheduled_delete(conn, batch, node).await,
            Strategy::MaterializedPath(s) => s.scheduled_delete(conn, batch, node).await,
        }
    }

    async fn flush_end<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: BatchContext<M>,
    ) -> Result<(), TreeError> {
        match self {
            Strategy::NestedSet(s) => s.flush_end(conn, batch).await,
            Strategy::Closure(s) => s.flush_end(conn, batch).await,
            Strategy::MaterializedPath(s) => s.flush_end(conn, batch).await,
        }
    }
}
