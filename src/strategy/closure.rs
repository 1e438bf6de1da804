//! Closure table maintenance: one `(ancestor, descendant, depth)` row per
//! ancestor pair, including the `(node, node, 0)` self row.

use async_trait::async_trait;
use sea_orm::sea_query::{Func, Keyword, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, EntityTrait, QueryFilter, Statement, Value};
use tracing::debug;

use crate::batch::BatchContext;
use crate::change_set::ChangeSet;
use crate::config::{ClosureFields, DependentBehavior, StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{bigint, col, execute, find_node, ident, load_node, quote, table};
use crate::strategy::TreeStrategy;
use crate::traits::{id_value, TreeModel};

/// One row of the closure table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureRow<Id> {
    pub ancestor: Id,
    pub descendant: Id,
    pub depth: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct ClosureTable<'c> {
    config: &'c TreeConfig,
    fields: &'c ClosureFields,
}

impl<'c> ClosureTable<'c> {
    pub fn new(config: &'c TreeConfig, fields: &'c ClosureFields) -> Self {
        Self { config, fields }
    }

    pub fn fields(&self) -> &'c ClosureFields {
        self.fields
    }

    async fn rows_where<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        column: &str,
        id: &M::Id,
    ) -> Result<Vec<ClosureRow<M::Id>>, TreeError> {
        let backend = conn.get_database_backend();
        let mut select = Query::select();
        select
            .column(ident(self.fields.ancestor()))
            .column(ident(self.fields.descendant()))
            .expr_as(
                Func::cast_as(col(self.fields.depth()), bigint(backend)),
                ident(self.fields.depth()),
            )
            .from(table(self.fields.table()))
            .and_where(col(column).eq(id_value::<M>(id)));

        let rows = conn.query_all(backend.build(&select)).await?;
        rows.into_iter()
            .map(|row| -> Result<ClosureRow<M::Id>, TreeError> {
                let depth: i64 = row.try_get("", self.fields.depth())?;
                Ok(ClosureRow {
                    ancestor: row.try_get("", self.fields.ancestor())?,
                    descendant: row.try_get("", self.fields.descendant())?,
                    depth: i32::try_from(depth)
                        .map_err(|_| TreeError::invariant(format!("depth {depth} out of range")))?,
                })
            })
            .collect()
    }

    /// Rows linking `id` to itself and to every ancestor.
    pub async fn ancestor_rows<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<ClosureRow<M::Id>>, TreeError> {
        self.rows_where::<M, C>(conn, self.fields.descendant(), id)
            .await
    }

    /// Rows linking `id` to itself and to every descendant.
    pub async fn descendant_rows<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<Vec<ClosureRow<M::Id>>, TreeError> {
        self.rows_where::<M, C>(conn, self.fields.ancestor(), id)
            .await
    }

    async fn insert_rows<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        rows: Vec<ClosureRow<M::Id>>,
    ) -> Result<(), TreeError> {
        if rows.is_empty() {
            return Ok(());
        }

        let count = rows.len();
        let mut insert = Query::insert();
        insert.into_table(table(self.fields.table())).columns([
            ident(self.fields.ancestor()),
            ident(self.fields.descendant()),
            ident(self.fields.depth()),
        ]);
        for row in rows {
            insert.values([
                id_value::<M>(&row.ancestor).into(),
                id_value::<M>(&row.descendant).into(),
                row.depth.into(),
            ])?;
        }
        execute(conn, &insert).await?;
        debug!(table = self.fields.table(), count, "inserted closure rows");
        Ok(())
    }

    /// Link `id` under `parent`.
    ///
    /// With `graft_subtree` the node's existing subtree rows are kept and
    /// every descendant is linked to the new ancestors as well; otherwise
    /// the node is new and only gets its self row plus ancestor rows.
    pub async fn link<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        parent: Option<&M::Id>,
        graft_subtree: bool,
    ) -> Result<(), TreeError> {
        let subtree = if graft_subtree {
            self.descendant_rows::<M, C>(conn, id).await?
        } else {
            vec![ClosureRow {
                ancestor: id.clone(),
                descendant: id.clone(),
                depth: 0,
            }]
        };

        let mut rows = Vec::new();
        if !graft_subtree {
            rows.extend(subtree.iter().cloned());
        }

        if let Some(parent) = parent {
            let ancestors = self.ancestor_rows::<M, C>(conn, parent).await?;
            if ancestors.is_empty() {
                return Err(TreeError::precondition(format!(
                    "parent {parent:?} has no closure rows"
                )));
            }
            for ancestor in &ancestors {
                for below in &subtree {
                    rows.push(ClosureRow {
                        ancestor: ancestor.ancestor.clone(),
                        descendant: below.descendant.clone(),
                        depth: ancestor.depth + below.depth + 1,
                    });
                }
            }
        }

        self.insert_rows::<M, C>(conn, rows).await
    }

    /// Drop the rows tying `subtree` to nodes outside of it.
    async fn unlink_from_ancestors<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        subtree: &[M::Id],
    ) -> Result<u64, TreeError> {
        if subtree.is_empty() {
            return Ok(0);
        }
        let values: Vec<Value> = subtree.iter().map(id_value::<M>).collect();
        let mut delete = Query::delete();
        delete
            .from_table(table(self.fields.table()))
            .and_where(col(self.fields.descendant()).is_in(values.clone()))
            .and_where(col(self.fields.ancestor()).is_not_in(values));
        execute(conn, &delete).await
    }

    async fn delete_rows_of<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        descendants: &[M::Id],
    ) -> Result<u64, TreeError> {
        if descendants.is_empty() {
            return Ok(0);
        }
        let values: Vec<Value> = descendants.iter().map(id_value::<M>).collect();
        let mut delete = Query::delete();
        delete
            .from_table(table(self.fields.table()))
            .and_where(col(self.fields.descendant()).is_in(values));
        execute(conn, &delete).await
    }

    /// Recompute the denormalized child count and level columns.
    pub async fn refresh_derived<C: ConnectionTrait>(&self, conn: &C) -> Result<(), TreeError> {
        let backend = conn.get_database_backend();
        let node_table = quote(backend, self.config.table());
        let closure = quote(backend, self.fields.table());
        let id = quote(backend, self.config.id_column());
        let ancestor = quote(backend, self.fields.ancestor());
        let descendant = quote(backend, self.fields.descendant());
        let depth = quote(backend, self.fields.depth());

        if let Some(child_count) = self.fields.child_count() {
            let child_count = quote(backend, child_count);
            let sql = format!(
                "UPDATE {node_table} SET {child_count} = (SELECT COUNT(*) FROM {closure} \
                 WHERE {closure}.{ancestor} = {node_table}.{id} AND {closure}.{depth} = 1)"
            );
            conn.execute(Statement::from_string(backend, sql)).await?;
        }
        if let Some(level) = self.fields.level() {
            let level = quote(backend, level);
            let sql = format!(
                "UPDATE {node_table} SET {level} = COALESCE((SELECT MAX({closure}.{depth}) \
                 FROM {closure} WHERE {closure}.{descendant} = {node_table}.{id}), 0)"
            );
            conn.execute(Statement::from_string(backend, sql)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'c, M: TreeModel> TreeStrategy<M> for ClosureTable<'c> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Closure
    }

    async fn pre_insert<C: ConnectionTrait>(
        &self,
        _conn: &C,
        _batch: &mut BatchContext<M>,
        active: &mut M::ActiveModel,
        _parent: Option<&M::Id>,
    ) -> Result<(), TreeError> {
        if let Some(child_count) = self.fields.child_count() {
            M::set_field(active, child_count, Value::from(0i64))?;
        }
        if let Some(level) = self.fields.level() {
            M::set_field(active, level, Value::from(0i64))?;
        }
        Ok(())
    }

    async fn post_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        let parent = node.parent_id();
        self.link::<M, C>(conn, &node.id(), parent.as_ref(), false)
            .await?;
        batch.mark_structure_changed();
        Ok(())
    }

    async fn scheduled_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
        changes: &ChangeSet,
    ) -> Result<(), TreeError> {
        if !changes.changed(self.config.parent_column()) {
            return Ok(());
        }

        let node: M = load_node(conn, self.config, &node.id()).await?;
        let id = node.id();
        let subtree: Vec<M::Id> = self
            .descendant_rows::<M, C>(conn, &id)
            .await?
            .into_iter()
            .map(|row| row.descendant)
            .collect();

        let parent = node.parent_id();
        if let Some(parent) = &parent {
            if subtree.contains(parent) {
                return Err(TreeError::cyclic(&id, parent));
            }
        }

        let removed = self.unlink_from_ancestors::<M, C>(conn, &subtree).await?;
        debug!(?id, removed, "unlinked closure subtree from its old ancestors");
        self.link::<M, C>(conn, &id, parent.as_ref(), true).await?;
        batch.mark_structure_changed();
        Ok(())
    }

    async fn scheduled_delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        node: &M,
    ) -> Result<(), TreeError> {
        let Some(node) = find_node::<M, C>(conn, self.config, &node.id()).await? else {
            return Ok(());
        };
        let id = node.id();
        let below: Vec<M::Id> = self
            .descendant_rows::<M, C>(conn, &id)
            .await?
            .into_iter()
            .map(|row| row.descendant)
            .filter(|descendant| descendant != &id)
            .collect();

        match self.config.dependent_behavior() {
            DependentBehavior::Destroy => {
                let mut doomed = below.clone();
                doomed.push(id.clone());
                self.delete_rows_of::<M, C>(conn, &doomed).await?;
                if !below.is_empty() {
                    let values: Vec<Value> = below.iter().map(id_value::<M>).collect();
                    let removed = M::Entity::delete_many()
                        .filter(col(self.config.id_column()).is_in(values))
                        .exec(conn)
                        .await?
                        .rows_affected;
                    debug!(?id, removed, "deleted closure descendants");
                }
            }
            DependentBehavior::Nullify => {
                self.unlink_from_ancestors::<M, C>(conn, &below).await?;
                self.delete_rows_of::<M, C>(conn, std::slice::from_ref(&id))
                    .await?;
                let mut update = Query::update();
                update
                    .table(table(self.config.table()))
                    .value(ident(self.config.parent_column()), SimpleExpr::Keyword(Keyword::Null))
                    .and_where(col(self.config.parent_column()).eq(id_value::<M>(&id)));
                let detached = execute(conn, &update).await?;
                debug!(?id, detached, "detached closure children");
            }
        }
        batch.mark_structure_changed();
        Ok(())
    }

    async fn flush_end<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: BatchContext<M>,
    ) -> Result<(), TreeError> {
        if batch.structure_changed() {
            self.refresh_derived(conn).await?;
        }
        batch.finish()
    }
}
