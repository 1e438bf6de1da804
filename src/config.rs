use std::fmt;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The tree encoding maintained for a model.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    NestedSet,
    Closure,
    MaterializedPath,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::NestedSet => "nested set",
            StrategyKind::Closure => "closure table",
            StrategyKind::MaterializedPath => "materialized path",
        })
    }
}

/// Columns used by the nested set encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NestedSetFields {
    left: String,
    right: String,
    level: Option<String>,
    root: Option<String>,
}

impl NestedSetFields {
    pub fn left(&self) -> &str {
        &self.left
    }

    pub fn right(&self) -> &str {
        &self.right
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }

    /// Column partitioning the table into independent trees.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }
}

/// Table and columns used by the closure table encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClosureFields {
    table: String,
    ancestor: String,
    descendant: String,
    depth: String,
    child_count: Option<String>,
    level: Option<String>,
}

impl ClosureFields {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ancestor(&self) -> &str {
        &self.ancestor
    }

    pub fn descendant(&self) -> &str {
        &self.descendant
    }

    pub fn depth(&self) -> &str {
        &self.depth
    }

    /// Denormalized direct-children counter on the node table.
    pub fn child_count(&self) -> Option<&str> {
        self.child_count.as_deref()
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }
}

/// Columns and formatting used by the materialized path encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathFields {
    path: String,
    source: String,
    separator: String,
    append_id: bool,
    starts_with_separator: bool,
    ends_with_separator: bool,
    level: Option<String>,
}

impl PathFields {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Column whose value becomes this node's path segment.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn append_id(&self) -> bool {
        self.append_id
    }

    pub fn starts_with_separator(&self) -> bool {
        self.starts_with_separator
    }

    pub fn ends_with_separator(&self) -> bool {
        self.ends_with_separator
    }

    pub fn level(&self) -> Option<&str> {
        self.level.as_deref()
    }
}

/// Strategy-specific storage layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeLayout {
    NestedSet(NestedSetFields),
    Closure(ClosureFields),
    MaterializedPath(PathFields),
}

impl TreeLayout {
    pub fn kind(&self) -> StrategyKind {
        match self {
            TreeLayout::NestedSet(_) => StrategyKind::NestedSet,
            TreeLayout::Closure(_) => StrategyKind::Closure,
            TreeLayout::MaterializedPath(_) => StrategyKind::MaterializedPath,
        }
    }
}

/// Resolved, validated configuration describing how a SeaORM model stores
/// its hierarchy.
#[derive(Clone, Debug)]
pub struct TreeConfig {
    entity_name: String,
    table: String,
    id_column: String,
    parent_column: String,
    layout: TreeLayout,
    dependent_behavior: DependentBehavior,
    order_strategy: Option<OrderStrategy>,
    advisory_lock_strategy: AdvisoryLockStrategy,
}

impl TreeConfig {
    /// Human-readable Rust struct name for the entity.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Table backing the entity.
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Column storing the parent foreign key.
    pub fn parent_column(&self) -> &str {
        &self.parent_column
    }

    pub fn strategy(&self) -> StrategyKind {
        self.layout.kind()
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    /// Dependent behavior when deleting nodes.
    pub fn dependent_behavior(&self) -> DependentBehavior {
        self.dependent_behavior
    }

    /// Ordering strategy to apply when returning children.
    pub fn order_strategy(&self) -> Option<&OrderStrategy> {
        self.order_strategy.as_ref()
    }

    /// Advisory lock taken around a flush.
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }

    /// Every column of the node table this configuration reads or writes.
    pub fn node_columns(&self) -> Vec<&str> {
        let mut columns = vec![self.id_column.as_str(), self.parent_column.as_str()];
        match &self.layout {
            TreeLayout::NestedSet(fields) => {
                columns.push(fields.left());
                columns.push(fields.right());
                columns.extend(fields.level());
                columns.extend(fields.root());
            }
            TreeLayout::Closure(fields) => {
                columns.extend(fields.child_count());
                columns.extend(fields.level());
            }
            TreeLayout::MaterializedPath(fields) => {
                columns.push(fields.path());
                columns.push(fields.source());
                columns.extend(fields.level());
            }
        }
        if let Some(OrderStrategy::NumericColumn { column }) = &self.order_strategy {
            columns.push(column.as_str());
        }
        columns
    }
}

/// Builder-style options consumed by the derive macro, or loaded from JSON.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeOptions {
    strategy: Option<StrategyKind>,
    id_column: Option<String>,
    parent_column: Option<String>,
    left_column: Option<String>,
    right_column: Option<String>,
    level_column: Option<String>,
    root_column: Option<String>,
    closure_table: Option<String>,
    ancestor_column: Option<String>,
    descendant_column: Option<String>,
    depth_column: Option<String>,
    child_count_column: Option<String>,
    path_column: Option<String>,
    path_source_column: Option<String>,
    path_separator: Option<String>,
    path_append_id: Option<bool>,
    path_starts_with_separator: Option<bool>,
    path_ends_with_separator: Option<bool>,
    dependent_behavior: Option<DependentBehavior>,
    order_strategy: Option<OrderStrategy>,
    advisory_lock_strategy: Option<AdvisoryLockStrategy>,
}

impl TreeOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Json(err.to_string()))
    }

    pub fn strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy = Some(kind);
        self
    }

    pub fn id_column(mut self, value: impl Into<String>) -> Self {
        self.id_column = Some(value.into());
        self
    }

    pub fn parent_column(mut self, value: impl Into<String>) -> Self {
        self.parent_column = Some(value.into());
        self
    }

    pub fn left_column(mut self, value: impl Into<String>) -> Self {
        self.left_column = Some(value.into());
        self
    }

    pub fn right_column(mut self, value: impl Into<String>) -> Self {
        self.right_column = Some(value.into());
        self
    }

    pub fn level_column(mut self, value: impl Into<String>) -> Self {
        self.level_column = Some(value.into());
        self
    }

    pub fn root_column(mut self, value: impl Into<String>) -> Self {
        self.root_column = Some(value.into());
        self
    }

    pub fn closure_table(mut self, value: impl Into<String>) -> Self {
        self.closure_table = Some(value.into());
        self
    }

    pub fn ancestor_column(mut self, value: impl Into<String>) -> Self {
        self.ancestor_column = Some(value.into());
        self
    }

    pub fn descendant_column(mut self, value: impl Into<String>) -> Self {
        self.descendant_column = Some(value.into());
        self
    }

    pub fn depth_column(mut self, value: impl Into<String>) -> Self {
        self.depth_column = Some(value.into());
        self
    }

    pub fn child_count_column(mut self, value: impl Into<String>) -> Self {
        self.child_count_column = Some(value.into());
        self
    }

    pub fn path_column(mut self, value: impl Into<String>) -> Self {
        self.path_column = Some(value.into());
        self
    }

    pub fn path_source_column(mut self, value: impl Into<String>) -> Self {
        self.path_source_column = Some(value.into());
        self
    }

    pub fn path_separator(mut self, value: impl Into<String>) -> Self {
        self.path_separator = Some(value.into());
        self
    }

    pub fn path_append_id(mut self, value: bool) -> Self {
        self.path_append_id = Some(value);
        self
    }

    pub fn path_starts_with_separator(mut self, value: bool) -> Self {
        self.path_starts_with_separator = Some(value);
        self
    }

    pub fn path_ends_with_separator(mut self, value: bool) -> Self {
        self.path_ends_with_separator = Some(value);
        self
    }

    pub fn dependent_behavior(mut self, behavior: DependentBehavior) -> Self {
        self.dependent_behavior = Some(behavior);
        self
    }

    pub fn order_strategy(mut self, strategy: OrderStrategy) -> Self {
        self.order_strategy = Some(strategy);
        self
    }

    pub fn advisory_lock_strategy(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock_strategy = Some(strategy);
        self
    }

    /// Overlay `other` on top of `self`; options set in `other` win.
    pub fn merge(self, other: TreeOptions) -> Self {
        Self {
            strategy: other.strategy.or(self.strategy),
            id_column: other.id_column.or(self.id_column),
            parent_column: other.parent_column.or(self.parent_column),
            left_column: other.left_column.or(self.left_column),
            right_column: other.right_column.or(self.right_column),
            level_column: other.level_column.or(self.level_column),
            root_column: other.root_column.or(self.root_column),
            closure_table: other.closure_table.or(self.closure_table),
            ancestor_column: other.ancestor_column.or(self.ancestor_column),
            descendant_column: other.descendant_column.or(self.descendant_column),
            depth_column: other.depth_column.or(self.depth_column),
            child_count_column: other.child_count_column.or(self.child_count_column),
            path_column: other.path_column.or(self.path_column),
            path_source_column: other.path_source_column.or(self.path_source_column),
            path_separator: other.path_separator.or(self.path_separator),
            path_append_id: other.path_append_id.or(self.path_append_id),
            path_starts_with_separator: other
                .path_starts_with_separator
                .or(self.path_starts_with_separator),
            path_ends_with_separator: other
                .path_ends_with_separator
                .or(self.path_ends_with_separator),
            dependent_behavior: other.dependent_behavior.or(self.dependent_behavior),
            order_strategy: other.order_strategy.or(self.order_strategy),
            advisory_lock_strategy: other.advisory_lock_strategy.or(self.advisory_lock_strategy),
        }
    }

    /// Validate the options and produce the configuration for one entity.
    pub fn build(
        self,
        entity_name: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<TreeConfig, ConfigError> {
        let entity_name = entity_name.into();
        let table = identifier("table", table.into())?;
        let strategy = self
            .strategy
            .ok_or_else(|| ConfigError::MissingStrategy(entity_name.clone()))?;
        self.reject_foreign_options(strategy)?;

        let id_column = identifier("id_column", or_default(self.id_column, "id"))?;
        let parent_column = identifier("parent_column", or_default(self.parent_column, "parent_id"))?;
        let level = optional_identifier("level_column", self.level_column)?;

        let layout = match strategy {
            StrategyKind::NestedSet => TreeLayout::NestedSet(NestedSetFields {
                left: identifier("left_column", or_default(self.left_column, "lft"))?,
                right: identifier("right_column", or_default(self.right_column, "rgt"))?,
                level,
                root: optional_identifier("root_column", self.root_column)?,
            }),
            StrategyKind::Closure => {
                let default_table = format!("{table}_closure");
                TreeLayout::Closure(ClosureFields {
                    table: identifier("closure_table", self.closure_table.unwrap_or(default_table))?,
                    ancestor: identifier(
                        "ancestor_column",
                        or_default(self.ancestor_column, "ancestor_id"),
                    )?,
                    descendant: identifier(
                        "descendant_column",
                        or_default(self.descendant_column, "descendant_id"),
                    )?,
                    depth: identifier("depth_column", or_default(self.depth_column, "depth"))?,
                    child_count: optional_identifier("child_count_column", self.child_count_column)?,
                    level,
                })
            }
            StrategyKind::MaterializedPath => {
                let separator = self.path_separator.unwrap_or_else(|| ",".to_string());
                if separator.is_empty() {
                    return Err(ConfigError::EmptySeparator);
                }
                let source = match self.path_source_column {
                    Some(source) => identifier("path_source_column", source)?,
                    None => id_column.clone(),
                };
                TreeLayout::MaterializedPath(PathFields {
                    path: identifier("path_column", or_default(self.path_column, "path"))?,
                    source,
                    separator,
                    append_id: self.path_append_id.unwrap_or(false),
                    starts_with_separator: self.path_starts_with_separator.unwrap_or(false),
                    ends_with_separator: self.path_ends_with_separator.unwrap_or(true),
                    level,
                })
            }
        };

        let dependent_behavior = self.dependent_behavior.unwrap_or_default();
        if strategy == StrategyKind::NestedSet && dependent_behavior != DependentBehavior::Destroy
        {
            return Err(ConfigError::UnsupportedBehavior {
                behavior: dependent_behavior.as_str(),
                strategy,
            });
        }

        let order_strategy = match self.order_strategy {
            Some(OrderStrategy::NumericColumn { column }) => Some(OrderStrategy::NumericColumn {
                column: identifier("order_strategy", column)?,
            }),
            other => other,
        };

        let advisory_lock_strategy = self.advisory_lock_strategy.unwrap_or_else(|| {
            AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::derived_from(&entity_name, &table))
        });

        let config = TreeConfig {
            entity_name,
            table,
            id_column,
            parent_column,
            layout,
            dependent_behavior,
            order_strategy,
            advisory_lock_strategy,
        };
        ensure_distinct(&config)?;
        Ok(config)
    }

    fn reject_foreign_options(&self, strategy: StrategyKind) -> Result<(), ConfigError> {
        use StrategyKind::*;

        let options: [(&'static str, bool, &[StrategyKind]); 15] = [
            ("left_column", self.left_column.is_some(), &[NestedSet]),
            ("right_column", self.right_column.is_some(), &[NestedSet]),
            ("root_column", self.root_column.is_some(), &[NestedSet]),
            ("closure_table", self.closure_table.is_some(), &[Closure]),
            ("ancestor_column", self.ancestor_column.is_some(), &[Closure]),
            ("descendant_column", self.descendant_column.is_some(), &[Closure]),
            ("depth_column", self.depth_column.is_some(), &[Closure]),
            ("child_count_column", self.child_count_column.is_some(), &[Closure]),
            ("path_column", self.path_column.is_some(), &[MaterializedPath]),
            ("path_source_column", self.path_source_column.is_some(), &[MaterializedPath]),
            ("path_separator", self.path_separator.is_some(), &[MaterializedPath]),
            ("path_append_id", self.path_append_id.is_some(), &[MaterializedPath]),
            (
                "path_starts_with_separator",
                self.path_starts_with_separator.is_some(),
                &[MaterializedPath],
            ),
            (
                "path_ends_with_separator",
                self.path_ends_with_separator.is_some(),
                &[MaterializedPath],
            ),
            ("order_strategy", self.order_strategy.is_some(), &[Closure, MaterializedPath]),
        ];

        for (option, set, allowed) in options {
            if set && !allowed.contains(&strategy) {
                return Err(ConfigError::UnsupportedOption { option, strategy });
            }
        }
        Ok(())
    }
}

fn or_default(value: Option<String>, default: &str) -> String {
    value.unwrap_or_else(|| default.to_string())
}

fn identifier(option: &'static str, value: String) -> Result<String, ConfigError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(value)
    } else {
        Err(ConfigError::InvalidIdentifier { option, value })
    }
}

fn optional_identifier(
    option: &'static str,
    value: Option<String>,
) -> Result<Option<String>, ConfigError> {
    value.map(|value| identifier(option, value)).transpose()
}

fn ensure_distinct(config: &TreeConfig) -> Result<(), ConfigError> {
    let mut written: Vec<&str> = vec![config.parent_column()];
    match config.layout() {
        TreeLayout::NestedSet(fields) => {
            written.push(fields.left());
            written.push(fields.right());
            written.extend(fields.level());
            written.extend(fields.root());
        }
        TreeLayout::Closure(fields) => {
            written.extend(fields.child_count());
            written.extend(fields.level());
        }
        TreeLayout::MaterializedPath(fields) => {
            written.push(fields.path());
            written.extend(fields.level());
        }
    }
    written.push(config.id_column());

    for (index, column) in written.iter().enumerate() {
        if let Some(other) = written[index + 1..].iter().find(|other| *other == column) {
            return Err(ConfigError::DuplicateColumn(
                column.to_string(),
                other.to_string(),
            ));
        }
    }
    Ok(())
}

/// Behaviour to apply to dependent nodes when destroying a record.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentBehavior {
    /// Delete the whole subtree.
    #[default]
    Destroy,
    /// Detach the direct children, turning them into roots.
    Nullify,
}

impl DependentBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependentBehavior::Destroy => "destroy",
            DependentBehavior::Nullify => "nullify",
        }
    }
}

/// Strategy used to generate deterministic ordering of children.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStrategy {
    Manual,
    NumericColumn { column: String },
}

impl OrderStrategy {
    pub fn numeric_column(column: impl Into<String>) -> Self {
        Self::NumericColumn {
            column: column.into(),
        }
    }
}

/// Key used for advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derived_from(entity: &str, table: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(table.as_bytes());
        let crc = hasher.finalize();
        Self(format!("tree-behavior::{entity}::{table}::{crc:x}"))
    }
}

/// Configuration describing how to serialise structural writers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_set_defaults() {
        let config = TreeOptions::default()
            .strategy(StrategyKind::NestedSet)
            .level_column("lvl")
            .build("Category", "categories")
            .unwrap();

        let TreeLayout::NestedSet(fields) = config.layout() else {
            panic!("expected nested set layout");
        };
        assert_eq!(fields.left(), "lft");
        assert_eq!(fields.right(), "rgt");
        assert_eq!(fields.level(), Some("lvl"));
        assert_eq!(fields.root(), None);
        assert_eq!(config.parent_column(), "parent_id");
        assert_eq!(config.dependent_behavior(), DependentBehavior::Destroy);

        let key = config.advisory_lock_strategy().key().unwrap();
        assert!(key.as_str().starts_with("tree-behavior::Category::categories::"));
    }

    #[test]
    fn closure_table_name_defaults_to_node_table() {
        let config = TreeOptions::default()
            .strategy(StrategyKind::Closure)
            .build("Category", "categories")
            .unwrap();

        let TreeLayout::Closure(fields) = config.layout() else {
            panic!("expected closure layout");
        };
        assert_eq!(fields.table(), "categories_closure");
        assert_eq!(fields.ancestor(), "ancestor_id");
        assert_eq!(fields.descendant(), "descendant_id");
        assert_eq!(fields.depth(), "depth");
    }

    #[test]
    fn missing_strategy_is_rejected() {
        let err = TreeOptions::default().build("Category", "categories").unwrap_err();
        assert_eq!(err, ConfigError::MissingStrategy("Category".into()));
    }

    #[test]
    fn options_of_another_strategy_are_rejected() {
        let err = TreeOptions::default()
            .strategy(StrategyKind::Closure)
            .left_column("lft")
            .build("Category", "categories")
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedOption {
                option: "left_column",
                strategy: StrategyKind::Closure,
            }
        );
    }

    #[test]
    fn nested_set_cannot_nullify_children() {
        let err = TreeOptions::default()
            .strategy(StrategyKind::NestedSet)
            .dependent_behavior(DependentBehavior::Nullify)
            .build("Category", "categories")
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedBehavior { .. }));
    }

    #[test]
    fn identifiers_are_validated() {
        let err = TreeOptions::default()
            .strategy(StrategyKind::NestedSet)
            .left_column("lft; DROP TABLE x")
            .build("Category", "categories")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidIdentifier {
                option: "left_column",
                ..
            }
        ));
    }

    #[test]
    fn columns_must_not_collide() {
        let err = TreeOptions::default()
            .strategy(StrategyKind::NestedSet)
            .left_column("pos")
            .right_column("pos")
            .build("Category", "categories")
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateColumn("pos".into(), "pos".into()));
    }

    #[test]
    fn empty_separator_is_rejected() {
        let err = TreeOptions::default()
            .strategy(StrategyKind::MaterializedPath)
            .path_separator("")
            .build("Category", "categories")
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptySeparator);
    }

    #[test]
    fn json_options_merge_over_defaults() {
        let base = TreeOptions::default()
            .strategy(StrategyKind::MaterializedPath)
            .path_source_column("slug");
        let overrides = TreeOptions::from_json(
            r#"{ "path_separator": "/", "dependent_behavior": "nullify", "advisory_lock_strategy": "disabled" }"#,
        )
        .unwrap();

        let config = base.merge(overrides).build("Page", "pages").unwrap();
        let TreeLayout::MaterializedPath(fields) = config.layout() else {
            panic!("expected materialized path layout");
        };
        assert_eq!(fields.separator(), "/");
        assert_eq!(fields.source(), "slug");
        assert!(fields.ends_with_separator());
        assert_eq!(config.dependent_behavior(), DependentBehavior::Nullify);
        assert_eq!(config.advisory_lock_strategy(), &AdvisoryLockStrategy::Disabled);
    }

    #[test]
    fn unknown_json_options_are_rejected() {
        let err = TreeOptions::from_json(r#"{ "lefty": "lft" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
