use thiserror::Error;

use crate::config::StrategyKind;

/// Errors returned by the tree maintenance APIs.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid tree configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("query build error: {0}")]
    QueryBuild(#[from] sea_orm::sea_query::error::Error),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {node} cannot be moved under {parent}, which is itself or one of its descendants")]
    CyclicParent { node: String, parent: String },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("`{operation}` is not supported by the {strategy} strategy")]
    UnsupportedOperation {
        operation: &'static str,
        strategy: StrategyKind,
    },

    #[error("path source `{0}` contains the path separator")]
    InvalidPathSource(String),

    #[error("model has no tracked field `{0}`")]
    UnknownField(String),

    #[error("field `{field}` cannot hold value {value}")]
    FieldType { field: String, value: String },

    #[error("tree invariant violation: {0}")]
    Invariant(String),
}

impl TreeError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }

    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::Precondition(detail.into())
    }

    pub(crate) fn not_found(id: &impl std::fmt::Debug) -> Self {
        Self::NodeNotFound(format!("{id:?}"))
    }

    pub(crate) fn cyclic(node: &impl std::fmt::Debug, parent: &impl std::fmt::Debug) -> Self {
        Self::CyclicParent {
            node: format!("{node:?}"),
            parent: format!("{parent:?}"),
        }
    }
}

/// Problems detected while resolving a tree configuration.
///
/// These are raised before any statement runs; a model whose configuration
/// fails to resolve is never processed.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("no tree strategy configured for `{0}`")]
    MissingStrategy(String),

    #[error("option `{option}` has invalid identifier `{value}`")]
    InvalidIdentifier { option: &'static str, value: String },

    #[error("option `{option}` is not supported by the {strategy} strategy")]
    UnsupportedOption {
        option: &'static str,
        strategy: StrategyKind,
    },

    #[error("dependent behavior `{behavior}` is not supported by the {strategy} strategy")]
    UnsupportedBehavior {
        behavior: &'static str,
        strategy: StrategyKind,
    },

    #[error("column `{column}` does not exist on `{entity}`")]
    UnknownColumn { entity: String, column: String },

    #[error("columns `{0}` and `{1}` must be distinct")]
    DuplicateColumn(String, String),

    #[error("path separator cannot be empty")]
    EmptySeparator,

    #[error("malformed tree options: {0}")]
    Json(String),
}
