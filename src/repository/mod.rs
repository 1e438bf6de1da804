//! Read queries over a tree, and the maintenance operations specific to
//! one strategy.

mod closure;
mod nested_set;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::marker::PhantomData;

use sea_orm::{
    ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    Select, Value,
};

use crate::config::{OrderStrategy, TreeConfig, TreeLayout};
use crate::error::TreeError;
use crate::lock::LockedTransaction;
use crate::query::{col, col_expr, load_node, starts_with};
use crate::strategy::{ClosureTable, NestedSet, Strategy};
use crate::traits::{id_value, resolve_metadata, TreeModel};

pub use nested_set::VerificationIssue;

/// Repository exposing the tree queries for a given model, whatever the
/// configured strategy.
#[derive(Debug, Default)]
pub struct TreeRepository<M>
where
    M: TreeModel,
{
    _marker: PhantomData<M>,
}

impl<M> TreeRepository<M>
where
    M: TreeModel,
{
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn config(&self) -> Result<&'static TreeConfig, TreeError> {
        resolve_metadata::<M>()
    }

    fn strategy(&self) -> Result<Strategy<'static>, TreeError> {
        Ok(Strategy::for_config(self.config()?))
    }

    fn unsupported(&self, operation: &'static str) -> TreeError {
        match self.config() {
            Ok(config) => TreeError::UnsupportedOperation {
                operation,
                strategy: config.strategy(),
            },
            Err(err) => err,
        }
    }

    async fn lock(&self, db: &DatabaseConnection) -> Result<LockedTransaction, TreeError> {
        LockedTransaction::acquire(self.config()?.advisory_lock_strategy(), db).await
    }

    /// Sibling order: interval order for nested sets, otherwise the
    /// configured order column followed by the id.
    fn ordered(&self, config: &TreeConfig, query: Select<M::Entity>) -> Select<M::Entity> {
        match config.layout() {
            TreeLayout::NestedSet(fields) => {
                let query = match fields.root() {
                    Some(root) => query.order_by_asc(col_expr(root)),
                    None => query,
                };
                query.order_by_asc(col_expr(fields.left()))
            }
            TreeLayout::Closure(_) | TreeLayout::MaterializedPath(_) => {
                let query = match config.order_strategy() {
                    Some(OrderStrategy::NumericColumn { column }) => {
                        query.order_by_asc(col_expr(column))
                    }
                    _ => query,
                };
                query.order_by_asc(col_expr(config.id_column()))
            }
        }
    }

    async fn fetch_by_ids<C: ConnectionTrait>(
        &self,
        conn: &C,
        config: &TreeConfig,
        ids: &[M::Id],
    ) -> Result<Vec<M>, TreeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Value> = ids.iter().map(id_value::<M>).collect();
        let query = M::Entity::find().filter(col(config.id_column()).is_in(values));
        Ok(self.ordered(config, query).all(conn).await?)
    }

    pub async fn parent<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
    ) -> Result<Option<M>, TreeError> {
        let config = self.config()?;
        match node.parent_id() {
            Some(parent) => Ok(Some(load_node(conn, config, &parent).await?)),
            None => Ok(None),
        }
    }

    pub async fn roots<C: ConnectionTrait>(&self, conn: &C) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let query = M::Entity::find().filter(col(config.parent_column()).is_null());
        Ok(self.ordered(config, query).all(conn).await?)
    }

    /// Direct children, or every descendant when `direct` is false.
    pub async fn children<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        direct: bool,
    ) -> Result<Vec<M>, TreeError> {
        if !direct {
            return self.descendants(conn, node).await;
        }
        let config = self.config()?;
        let query = M::Entity::find()
            .filter(col(config.parent_column()).eq(id_value::<M>(&node.id())));
        Ok(self.ordered(config, query).all(conn).await?)
    }

    /// Every node below `node`, in pre-order for nested sets and paths,
    /// by depth for closure tables.
    pub async fn descendants<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
    ) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let node: M = load_node(conn, config, &node.id()).await?;

        match self.strategy()? {
            Strategy::NestedSet(nested) => {
                let Some(bounds) = nested.bounds(&node) else {
                    return Ok(Vec::new());
                };
                let fields = nested.fields();
                let mut query = M::Entity::find()
                    .filter(col(fields.left()).gt(bounds.left))
                    .filter(col(fields.right()).lt(bounds.right));
                if let Some(scope) = nested.scope_filter(bounds.scope.as_ref()) {
                    query = query.filter(scope);
                }
                Ok(query.order_by_asc(col_expr(fields.left())).all(conn).await?)
            }
            Strategy::Closure(closure) => {
                let rows = closure.descendant_rows::<M, C>(conn, &node.id()).await?;
                let depths: HashMap<M::Id, i32> = rows
                    .into_iter()
                    .filter(|row| row.depth > 0)
                    .map(|row| (row.descendant, row.depth))
                    .collect();
                let ids: Vec<M::Id> = depths.keys().cloned().collect();
                let mut nodes = self.fetch_by_ids(conn, config, &ids).await?;
                nodes.sort_by_key(|node| depths.get(&node.id()).copied().unwrap_or_default());
                Ok(nodes)
            }
            Strategy::MaterializedPath(path) => {
                let Some(own) = path.path_of(&node) else {
                    return Ok(Vec::new());
                };
                let fields = path.fields();
                Ok(M::Entity::find()
                    .filter(starts_with(fields.path(), &path.descendant_prefix(&own))?)
                    .filter(col(config.id_column()).ne(id_value::<M>(&node.id())))
                    .order_by_asc(col_expr(fields.path()))
                    .all(conn)
                    .await?)
            }
        }
    }

    pub async fn self_and_descendants<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
    ) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let mut nodes = vec![load_node::<M, C>(conn, config, &node.id()).await?];
        nodes.extend(self.descendants(conn, node).await?);
        Ok(nodes)
    }

    /// Ancestors of `node`, root first, excluding the node itself.
    pub async fn ancestors<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
    ) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let node: M = load_node(conn, config, &node.id()).await?;

        match self.strategy()? {
            Strategy::NestedSet(nested) => {
                let Some(bounds) = nested.bounds(&node) else {
                    return Ok(Vec::new());
                };
                let fields = nested.fields();
                let mut query = M::Entity::find()
                    .filter(col(fields.left()).lt(bounds.left))
                    .filter(col(fields.right()).gt(bounds.right));
                if let Some(scope) = nested.scope_filter(bounds.scope.as_ref()) {
                    query = query.filter(scope);
                }
                Ok(query.order_by_asc(col_expr(fields.left())).all(conn).await?)
            }
            Strategy::Closure(closure) => {
                let rows = closure.ancestor_rows::<M, C>(conn, &node.id()).await?;
                let depths: HashMap<M::Id, i32> = rows
                    .into_iter()
                    .filter(|row| row.depth > 0)
                    .map(|row| (row.ancestor, row.depth))
                    .collect();
                let ids: Vec<M::Id> = depths.keys().cloned().collect();
                let mut nodes = self.fetch_by_ids(conn, config, &ids).await?;
                nodes.sort_by_key(|node| Reverse(depths.get(&node.id()).copied().unwrap_or_default()));
                Ok(nodes)
            }
            Strategy::MaterializedPath(path) => {
                let Some(own) = path.path_of(&node) else {
                    return Ok(Vec::new());
                };
                let ancestors = path.ancestor_paths(&own);
                if ancestors.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(M::Entity::find()
                    .filter(col(path.fields().path()).is_in(ancestors))
                    .order_by_asc(col_expr(path.fields().path()))
                    .all(conn)
                    .await?)
            }
        }
    }

    /// Ancestors followed by the node itself.
    pub async fn path<C: ConnectionTrait>(&self, conn: &C, node: &M) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let mut nodes = self.ancestors(conn, node).await?;
        nodes.push(load_node::<M, C>(conn, config, &node.id()).await?);
        Ok(nodes)
    }

    /// Nodes sharing `node`'s parent; top-level nodes are siblings of each
    /// other.
    pub async fn siblings<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        include_self: bool,
    ) -> Result<Vec<M>, TreeError> {
        let config = self.config()?;
        let node: M = load_node(conn, config, &node.id()).await?;
        let mut query = match node.parent_id() {
            Some(parent) => {
                M::Entity::find().filter(col(config.parent_column()).eq(id_value::<M>(&parent)))
            }
            None => M::Entity::find().filter(col(config.parent_column()).is_null()),
        };
        if !include_self {
            query = query.filter(col(config.id_column()).ne(id_value::<M>(&node.id())));
        }
        Ok(self.ordered(config, query).all(conn).await?)
    }

    /// Number of direct children, or of all descendants.
    pub async fn child_count<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        direct: bool,
    ) -> Result<u64, TreeError> {
        let config = self.config()?;
        if direct {
            return Ok(M::Entity::find()
                .filter(col(config.parent_column()).eq(id_value::<M>(&node.id())))
                .count(conn)
                .await?);
        }

        let node: M = load_node(conn, config, &node.id()).await?;
        match self.strategy()? {
            Strategy::NestedSet(nested) => Ok(nested
                .bounds(&node)
                .map(|bounds| ((bounds.right - bounds.left - 1) / 2) as u64)
                .unwrap_or(0)),
            Strategy::Closure(closure) => {
                let rows = closure.descendant_rows::<M, C>(conn, &node.id()).await?;
                Ok(rows.iter().filter(|row| row.depth > 0).count() as u64)
            }
            Strategy::MaterializedPath(path) => {
                let Some(own) = path.path_of(&node) else {
                    return Ok(0);
                };
                Ok(M::Entity::find()
                    .filter(starts_with(path.fields().path(), &path.descendant_prefix(&own))?)
                    .filter(col(config.id_column()).ne(id_value::<M>(&node.id())))
                    .count(conn)
                    .await?)
            }
        }
    }

    fn nested_set(&self, operation: &'static str) -> Result<NestedSet<'static>, TreeError> {
        match self.strategy()? {
            Strategy::NestedSet(nested) => Ok(nested),
            _ => Err(self.unsupported(operation)),
        }
    }

    fn closure(&self, operation: &'static str) -> Result<ClosureTable<'static>, TreeError> {
        match self.strategy()? {
            Strategy::Closure(closure) => Ok(closure),
            _ => Err(self.unsupported(operation)),
        }
    }
}

/// Commit on success, roll back and return the original error otherwise.
async fn finish<T>(guard: LockedTransaction, result: Result<T, TreeError>) -> Result<T, TreeError> {
    match result {
        Ok(value) => {
            guard.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = guard.rollback().await;
            Err(err)
        }
    }
}
