//! Materialized path maintenance: every node stores the concatenated
//! segments of its ancestors and itself, so subtree queries become prefix
//! matches.

use async_trait::async_trait;
use sea_orm::sea_query::{Keyword, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Value};
use tracing::debug;

use crate::batch::BatchContext;
use crate::change_set::ChangeSet;
use crate::config::{DependentBehavior, PathFields, StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{col, execute, find_node, ident, load_node, replace_prefix, starts_with, table};
use crate::strategy::TreeStrategy;
use crate::traits::{id_value, TreeModel};
use crate::value::as_string;

#[derive(Clone, Copy, Debug)]
pub struct MaterializedPath<'c> {
    config: &'c TreeConfig,
    fields: &'c PathFields,
}

impl<'c> MaterializedPath<'c> {
    pub fn new(config: &'c TreeConfig, fields: &'c PathFields) -> Self {
        Self { config, fields }
    }

    pub fn fields(&self) -> &'c PathFields {
        self.fields
    }

    fn trailing(&self) -> &'c str {
        if self.fields.ends_with_separator() {
            self.fields.separator()
        } else {
            ""
        }
    }

    /// Prefix shared by paths of top-level nodes.
    pub fn root_prefix(&self) -> &'c str {
        if self.fields.starts_with_separator() {
            self.fields.separator()
        } else {
            ""
        }
    }

    /// Path segment contributed by `source`, optionally suffixed with the id.
    pub fn segment(&self, source: &str, id: &str) -> Result<String, TreeError> {
        if source.contains(self.fields.separator()) {
            return Err(TreeError::InvalidPathSource(source.to_string()));
        }
        if self.fields.append_id() && self.fields.source() != self.config.id_column() {
            Ok(format!("{source}-{id}"))
        } else {
            Ok(source.to_string())
        }
    }

    /// Segment of a loaded node.
    pub fn segment_of<M: TreeModel>(&self, node: &M) -> Result<String, TreeError> {
        let id = as_string(&id_value::<M>(&node.id()))
            .ok_or_else(|| TreeError::precondition(format!("id of {:?} is not printable", node.id())))?;
        let source = node
            .field_value(self.fields.source())
            .ok_or_else(|| TreeError::UnknownField(self.fields.source().to_string()))?;
        let source = as_string(&source).ok_or_else(|| {
            TreeError::precondition(format!("node {id} has no {} value", self.fields.source()))
        })?;
        self.segment(&source, &id)
    }

    /// Full path of a node given the path of its parent.
    pub fn build_path(&self, parent_path: Option<&str>, segment: &str) -> String {
        match parent_path {
            Some(parent) => format!("{}{segment}{}", self.descendant_prefix(parent), self.trailing()),
            None => format!("{}{segment}{}", self.root_prefix(), self.trailing()),
        }
    }

    /// Prefix every descendant path of `path` starts with.
    pub fn descendant_prefix(&self, path: &str) -> String {
        if self.fields.ends_with_separator() {
            path.to_string()
        } else {
            format!("{path}{}", self.fields.separator())
        }
    }

    /// Segments of `path`, root first.
    pub fn segments<'p>(&self, path: &'p str) -> Vec<&'p str> {
        let separator = self.fields.separator();
        let mut trimmed = path;
        if self.fields.starts_with_separator() {
            trimmed = trimmed.strip_prefix(separator).unwrap_or(trimmed);
        }
        if self.fields.ends_with_separator() {
            trimmed = trimmed.strip_suffix(separator).unwrap_or(trimmed);
        }
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.split(separator).collect()
    }

    /// Depth of a node stored at `path`; top-level nodes are at `0`.
    pub fn depth(&self, path: &str) -> i64 {
        (self.segments(path).len() as i64 - 1).max(0)
    }

    /// Paths of every ancestor of `path`, root first.
    pub fn ancestor_paths(&self, path: &str) -> Vec<String> {
        let segments = self.segments(path);
        let mut paths = Vec::with_capacity(segments.len().saturating_sub(1));
        let mut current: Option<String> = None;
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            let next = self.build_path(current.as_deref(), segment);
            paths.push(next.clone());
            current = Some(next);
        }
        paths
    }

    /// Stored path of a node, `None` while it has not been computed yet.
    pub fn path_of<M: TreeModel>(&self, node: &M) -> Option<String> {
        node.field_value(self.fields.path())
            .and_then(|value| as_string(&value))
            .filter(|path| !path.is_empty())
    }

    async fn parent_path<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: &M::Id,
    ) -> Result<String, TreeError> {
        let parent: M = load_node(conn, self.config, parent).await?;
        self.path_of(&parent).ok_or_else(|| {
            TreeError::precondition(format!("parent {:?} has no path yet", parent.id()))
        })
    }

    async fn ensure_unique<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        path: &str,
    ) -> Result<(), TreeError> {
        let clashes = M::Entity::find()
            .filter(col(self.fields.path()).eq(path))
            .filter(col(self.config.id_column()).ne(id_value::<M>(id)))
            .count(conn)
            .await?;
        if clashes > 0 {
            return Err(TreeError::invariant(format!("path {path:?} is already taken")));
        }
        Ok(())
    }

    async fn write_path<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        path: &str,
    ) -> Result<(), TreeError> {
        let mut update = Query::update();
        update
            .table(table(self.config.table()))
            .value(ident(self.fields.path()), path)
            .and_where(col(self.config.id_column()).eq(id_value::<M>(id)));
        if let Some(level) = self.fields.level() {
            update.value(ident(level), self.depth(path));
        }
        execute(conn, &update).await?;
        Ok(())
    }

    /// Rewrite every path under `old_prefix` to start with `new_prefix`.
    async fn rewrite_descendants<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        old_prefix: &str,
        new_prefix: &str,
        level_delta: i64,
    ) -> Result<u64, TreeError> {
        let backend = conn.get_database_backend();
        let path = self.fields.path();
        let mut update = Query::update();
        update
            .table(table(self.config.table()))
            .value(ident(path), replace_prefix(backend, path, old_prefix, new_prefix)?)
            .and_where(starts_with(path, old_prefix)?)
            .and_where(col(self.config.id_column()).ne(id_value::<M>(id)));
        if let Some(level) = self.fields.level() {
            if level_delta != 0 {
                update.value(ident(level), col(level).add(level_delta));
            }
        }
        let rows = execute(conn, &update).await?;
        debug!(?id, old_prefix, new_prefix, rows, "rewrote descendant paths");
        Ok(rows)
    }
}

#[async_trait]
impl<'c, M: TreeModel> TreeStrategy<M> for MaterializedPath<'c> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::MaterializedPath
    }

    async fn pre_insert<C: ConnectionTrait>(
        &self,
        _conn: &C,
        _batch: &mut BatchContext<M>,
        active: &mut M::ActiveModel,
        _parent: Option<&M::Id>,
    ) -> Result<(), TreeError> {
        // Placeholder until the id is known.
        M::set_field(active, self.fields.path(), Value::from(String::new()))?;
        if let Some(level) = self.fields.level() {
            M::set_field(active, level, Value::from(0i64))?;
        }
        Ok(())
    }

    async fn post_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        _batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        let parent_path = match node.parent_id() {
            Some(parent) => Some(self.parent_path::<M, C>(conn, &parent).await?),
            None => None,
        };
        let path = self.build_path(parent_path.as_deref(), &self.segment_of(node)?);
        let id = node.id();
        self.ensure_unique::<M, C>(conn, &id, &path).await?;
        self.write_path::<M, C>(conn, &id, &path).await?;
        debug!(?id, path, "assigned materialized path");
        Ok(())
    }

    async fn scheduled_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        _batch: &mut BatchContext<M>,
        node: &M,
        changes: &ChangeSet,
    ) -> Result<(), TreeError> {
        let source_changed = self.fields.source() != self.config.id_column()
            && changes.changed(self.fields.source());
        if !changes.changed(self.config.parent_column()) && !source_changed {
            return Ok(());
        }

        let node: M = load_node(conn, self.config, &node.id()).await?;
        let id = node.id();
        let old_path = self.path_of(&node);

        let parent_path = match node.parent_id() {
            Some(parent) if parent == id => return Err(TreeError::cyclic(&id, &parent)),
            Some(parent) => {
                let parent_path = self.parent_path::<M, C>(conn, &parent).await?;
                if let Some(old_path) = &old_path {
                    if parent_path.starts_with(&self.descendant_prefix(old_path)) {
                        return Err(TreeError::cyclic(&id, &parent));
                    }
                }
                Some(parent_path)
            }
            None => None,
        };

        let new_path = self.build_path(parent_path.as_deref(), &self.segment_of(&node)?);
        if old_path.as_deref() == Some(new_path.as_str()) {
            return Ok(());
        }

        self.ensure_unique::<M, C>(conn, &id, &new_path).await?;
        self.write_path::<M, C>(conn, &id, &new_path).await?;
        if let Some(old_path) = old_path {
            let level_delta = self.depth(&new_path) - self.depth(&old_path);
            self.rewrite_descendants::<M, C>(
                conn,
                &id,
                &self.descendant_prefix(&old_path),
                &self.descendant_prefix(&new_path),
                level_delta,
            )
            .await?;
        }
        Ok(())
    }

    async fn scheduled_delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        _batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        let Some(node) = find_node::<M, C>(conn, self.config, &node.id()).await? else {
            return Ok(());
        };
        let Some(path) = self.path_of(&node) else {
            return Ok(());
        };
        let id = node.id();
        let prefix = self.descendant_prefix(&path);

        match self.config.dependent_behavior() {
            DependentBehavior::Destroy => {
                let removed = M::Entity::delete_many()
                    .filter(starts_with(self.fields.path(), &prefix)?)
                    .filter(col(self.config.id_column()).ne(id_value::<M>(&id)))
                    .exec(conn)
                    .await?
                    .rows_affected;
                debug!(?id, removed, "deleted path descendants");
            }
            DependentBehavior::Nullify => {
                // Promoted children must not collide with existing top-level paths.
                let children = M::Entity::find()
                    .filter(col(self.config.parent_column()).eq(id_value::<M>(&id)))
                    .all(conn)
                    .await?;
                for child in &children {
                    let promoted = self.build_path(None, &self.segment_of(child)?);
                    self.ensure_unique::<M, C>(conn, &child.id(), &promoted).await?;
                }

                let level_delta = -(self.depth(&path) + 1);
                self.rewrite_descendants::<M, C>(conn, &id, &prefix, self.root_prefix(), level_delta)
                    .await?;
                let mut update = Query::update();
                update
                    .table(table(self.config.table()))
                    .value(ident(self.config.parent_column()), SimpleExpr::Keyword(Keyword::Null))
                    .and_where(col(self.config.parent_column()).eq(id_value::<M>(&id)));
                execute(conn, &update).await?;
            }
        }
        Ok(())
    }
}
