//! Nested set maintenance: every node owns a pre-order interval
//! `[left, right]` and ancestry is interval containment.

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Value};
use tracing::{debug, trace};

use crate::batch::BatchContext;
use crate::change_set::ChangeSet;
use crate::config::{NestedSetFields, StrategyKind, TreeConfig};
use crate::error::TreeError;
use crate::query::{col, execute, find_node, ident, load_node, table};
use crate::strategy::interval::{Direction, IntervalSynchronizer, ShiftCondition, ShiftField, Subtree};
use crate::strategy::TreeStrategy;
use crate::traits::{id_value, TreeModel};
use crate::value::{as_i64, is_null};

/// Interval of one persisted node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeBounds {
    pub left: i64,
    pub right: i64,
    pub level: Option<i64>,
    pub scope: Option<Value>,
}

impl NodeBounds {
    pub fn size(&self) -> i64 {
        self.right - self.left + 1
    }

    pub fn contains(&self, other: &NodeBounds) -> bool {
        self.left < other.left && other.right < self.right
    }

    fn subtree(&self) -> Subtree {
        Subtree {
            left: self.left,
            right: self.right,
            scope: self.scope.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NestedSet<'c> {
    config: &'c TreeConfig,
    fields: &'c NestedSetFields,
}

impl<'c> NestedSet<'c> {
    pub fn new(config: &'c TreeConfig, fields: &'c NestedSetFields) -> Self {
        Self { config, fields }
    }

    pub fn fields(&self) -> &'c NestedSetFields {
        self.fields
    }

    pub fn synchronizer(&self) -> IntervalSynchronizer<'c> {
        IntervalSynchronizer::new(self.config.table(), self.fields)
    }

    /// Interval of `node`, `None` while it has not been given one.
    pub fn bounds<M: TreeModel>(&self, node: &M) -> Option<NodeBounds> {
        let int = |field: &str| node.field_value(field).as_ref().and_then(as_i64);
        let left = int(self.fields.left())?;
        let right = int(self.fields.right())?;
        if left <= 0 || right <= 0 {
            return None;
        }
        Some(NodeBounds {
            left,
            right,
            level: self.fields.level().and_then(int),
            scope: self
                .fields
                .root()
                .and_then(|root| node.field_value(root))
                .filter(|value| !is_null(value)),
        })
    }

    fn same_tree(&self, a: &NodeBounds, b: &NodeBounds) -> bool {
        self.fields.root().is_none() || a.scope == b.scope
    }

    fn level_delta(&self, node: &NodeBounds, parent: &NodeBounds) -> i64 {
        match (node.level, parent.level) {
            (Some(node), Some(parent)) => parent + 1 - node,
            _ => 0,
        }
    }

    pub(crate) fn scope_filter(&self, scope: Option<&Value>) -> Option<SimpleExpr> {
        match (self.fields.root(), scope) {
            (Some(root), Some(scope)) => Some(col(root).eq(scope.clone())),
            _ => None,
        }
    }

    /// Write the interval (and level/root when configured) of one row.
    pub(crate) async fn assign<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        left: i64,
        right: i64,
        level: Option<i64>,
        scope: Option<Value>,
    ) -> Result<(), TreeError> {
        let mut update = Query::update();
        update
            .table(table(self.config.table()))
            .value(ident(self.fields.left()), left)
            .value(ident(self.fields.right()), right);
        if let (Some(column), Some(level)) = (self.fields.level(), level) {
            update.value(ident(column), level);
        }
        if let (Some(column), Some(scope)) = (self.fields.root(), scope) {
            update.value(ident(column), Expr::val(scope));
        }
        update.and_where(col(self.config.id_column()).eq(id_value::<M>(id)));
        execute(conn, &update).await?;
        trace!(?id, left, right, "assigned nested set interval");
        Ok(())
    }

    /// Place `node` under `parent` (or make it a root), keeping every other
    /// interval consistent.
    pub async fn adjust_node_with_parent<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &M,
        parent: Option<&M>,
    ) -> Result<(), TreeError> {
        let node_id = node.id();
        let bounds = self.bounds(node);

        let Some(parent) = parent else {
            return match bounds {
                Some(bounds) => self.move_to_root::<M, C>(conn, &node_id, &bounds).await,
                None => self.append_new_root::<M, C>(conn, &node_id).await,
            };
        };

        let target = self.bounds(parent).ok_or_else(|| {
            TreeError::precondition(format!(
                "parent {:?} of {:?} has no interval yet",
                parent.id(),
                node_id
            ))
        })?;

        let Some(bounds) = bounds else {
            return self.append_new_child::<M, C>(conn, &node_id, &target).await;
        };

        if self.same_tree(&bounds, &target)
            && target.left >= bounds.left
            && target.right <= bounds.right
        {
            return Err(TreeError::cyclic(&node_id, &parent.id()));
        }

        if self.same_tree(&bounds, &target)
            && target.contains(&bounds)
            && self.is_direct_child::<M, C>(conn, &bounds, &target).await?
        {
            trace!(?node_id, "node already nested under its parent");
            return Ok(());
        }

        self.move_under(conn, &bounds, &target).await
    }

    async fn is_direct_child<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &NodeBounds,
        parent: &NodeBounds,
    ) -> Result<bool, TreeError> {
        if let (Some(node), Some(parent)) = (node.level, parent.level) {
            return Ok(node == parent + 1);
        }

        let left = self.fields.left();
        let right = self.fields.right();
        let mut query = M::Entity::find()
            .filter(col(left).gt(parent.left))
            .filter(col(left).lt(node.left))
            .filter(col(right).gt(node.right))
            .filter(col(right).lt(parent.right));
        if let Some(scope) = self.scope_filter(node.scope.as_ref()) {
            query = query.filter(scope);
        }
        Ok(query.count(conn).await? == 0)
    }

    async fn append_new_root<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
    ) -> Result<(), TreeError> {
        let level = self.fields.level().map(|_| 0);
        match self.fields.root() {
            Some(_) => {
                self.assign::<M, C>(conn, id, 1, 2, level, Some(id_value::<M>(id)))
                    .await
            }
            None => {
                let edge = self.synchronizer().max_boundary(conn, None).await?;
                self.assign::<M, C>(conn, id, edge + 1, edge + 2, level, None)
                    .await
            }
        }
    }

    /// Give a fresh child the last two slots of its parent.
    async fn append_new_child<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        parent: &NodeBounds,
    ) -> Result<(), TreeError> {
        self.synchronizer()
            .synchronize(
                conn,
                2,
                Direction::Forward,
                &ShiftCondition::at_least(parent.right).in_scope(parent.scope.clone()),
                ShiftField::Both,
            )
            .await?;
        self.assign::<M, C>(
            conn,
            id,
            parent.right,
            parent.right + 1,
            parent.level.map(|level| level + 1),
            parent.scope.clone(),
        )
        .await
    }

    /// Detach the subtree at `node` and append it as a new root.
    pub(crate) async fn move_to_root<M: TreeModel, C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &M::Id,
        node: &NodeBounds,
    ) -> Result<(), TreeError> {
        let sync = self.synchronizer();
        let size = node.size();
        let level_delta = -node.level.unwrap_or(0);

        match self.fields.root() {
            None => {
                let edge = sync.max_boundary(conn, None).await?;
                sync.relocate(conn, &node.subtree(), edge - node.left + 1, level_delta, None)
                    .await?;
                sync.synchronize(
                    conn,
                    size,
                    Direction::Backward,
                    &ShiftCondition::greater_than(node.left),
                    ShiftField::Both,
                )
                .await?;
            }
            Some(_) => {
                let own_tree = id_value::<M>(id);
                if node.scope.as_ref() == Some(&own_tree) {
                    return Ok(());
                }
                sync.relocate(
                    conn,
                    &node.subtree(),
                    1 - node.left,
                    level_delta,
                    Some(own_tree),
                )
                .await?;
                sync.synchronize(
                    conn,
                    size,
                    Direction::Backward,
                    &ShiftCondition::greater_than(node.right).in_scope(node.scope.clone()),
                    ShiftField::Both,
                )
                .await?;
            }
        }
        debug!(?id, "moved nested set subtree to a new root");
        Ok(())
    }

    /// Move the subtree at `node` to become the last child of `parent`.
    ///
    /// The caller guarantees `parent` is not inside the subtree.
    pub(crate) async fn move_under<C: ConnectionTrait>(
        &self,
        conn: &C,
        node: &NodeBounds,
        parent: &NodeBounds,
    ) -> Result<(), TreeError> {
        let sync = self.synchronizer();
        let size = node.size();
        let level_delta = self.level_delta(node, parent);

        if !self.same_tree(node, parent) {
            sync.synchronize(
                conn,
                size,
                Direction::Forward,
                &ShiftCondition::at_least(parent.right).in_scope(parent.scope.clone()),
                ShiftField::Both,
            )
            .await?;
            sync.relocate(
                conn,
                &node.subtree(),
                parent.right - node.left,
                level_delta,
                parent.scope.clone(),
            )
            .await?;
            sync.synchronize(
                conn,
                size,
                Direction::Backward,
                &ShiftCondition::greater_than(node.right).in_scope(node.scope.clone()),
                ShiftField::Both,
            )
            .await?;
            debug!(size, "moved nested set subtree across trees");
            return Ok(());
        }

        let scope = node.scope.clone();
        let edge = sync.max_boundary(conn, scope.as_ref()).await?;

        // lift the subtree past the edge
        sync.relocate(conn, &node.subtree(), edge - node.left + 1, 0, None)
            .await?;

        // close the gap it left and open one before the parent's right boundary
        let target_left = if node.left > parent.right {
            sync.synchronize(
                conn,
                size,
                Direction::Forward,
                &ShiftCondition::between(parent.right, node.left - 1).in_scope(scope.clone()),
                ShiftField::Both,
            )
            .await?;
            parent.right
        } else {
            sync.synchronize(
                conn,
                size,
                Direction::Backward,
                &ShiftCondition::between(node.right + 1, parent.right - 1)
                    .in_scope(scope.clone()),
                ShiftField::Both,
            )
            .await?;
            parent.right - size
        };

        // drop it into place
        let lifted = Subtree {
            left: edge + 1,
            right: edge + size,
            scope,
        };
        sync.relocate(conn, &lifted, target_left - (edge + 1), level_delta, None)
            .await?;
        debug!(size, from = node.left, to = target_left, "moved nested set subtree");
        Ok(())
    }

    /// Exchange two adjacent sibling subtrees; `first` directly precedes
    /// `second` in the same tree.
    pub(crate) async fn swap_adjacent<C: ConnectionTrait>(
        &self,
        conn: &C,
        first: &NodeBounds,
        second: &NodeBounds,
    ) -> Result<(), TreeError> {
        if first.right + 1 != second.left || !self.same_tree(first, second) {
            return Err(TreeError::invariant(format!(
                "intervals [{}, {}] and [{}, {}] are not adjacent siblings",
                first.left, first.right, second.left, second.right
            )));
        }

        let sync = self.synchronizer();
        let edge = sync.max_boundary(conn, second.scope.as_ref()).await?;
        sync.relocate(conn, &second.subtree(), edge - second.left + 1, 0, None)
            .await?;
        sync.relocate(conn, &first.subtree(), second.size(), 0, None)
            .await?;
        let lifted = Subtree {
            left: edge + 1,
            right: edge + second.size(),
            scope: second.scope.clone(),
        };
        sync.relocate(conn, &lifted, first.left - (edge + 1), 0, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<'c, M: TreeModel> TreeStrategy<M> for NestedSet<'c> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NestedSet
    }

    async fn pre_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
        active: &mut M::ActiveModel,
        parent: Option<&M::Id>,
    ) -> Result<(), TreeError> {
        let (left, right) = match (parent, self.fields.root()) {
            (Some(_), _) => (0, 0),
            (None, Some(_)) => (1, 2),
            (None, None) => {
                let edge = match batch.tree_edge() {
                    Some(edge) => edge,
                    None => self.synchronizer().max_boundary(conn, None).await?,
                };
                batch.advance_edge(edge + 2);
                (edge + 1, edge + 2)
            }
        };
        trace!(left, right, "nested set pre-insert");

        M::set_field(active, self.fields.left(), Value::from(left))?;
        M::set_field(active, self.fields.right(), Value::from(right))?;
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
        match node.parent_id() {
            Some(parent) => batch.defer(node.id(), parent),
            None => {
                if let Some(root) = self.fields.root() {
                    let id = id_value::<M>(&node.id());
                    let mut update = Query::update();
                    update
                        .table(table(self.config.table()))
                        .value(ident(root), Expr::val(id.clone()))
                        .and_where(col(self.config.id_column()).eq(id));
                    execute(conn, &update).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_pending<C: ConnectionTrait>(
        &self,
        conn: &C,
        batch: &mut BatchContext<M>,
    ) -> Result<(), TreeError> {
        while let Some(pending) = batch.next_pending() {
            let node: M = load_node(conn, self.config, &pending.node).await?;
            let parent: M = load_node(conn, self.config, &pending.parent).await?;
            self.adjust_node_with_parent(conn, &node, Some(&parent))
                .await?;
            batch.mark_structure_changed();
        }
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
        let parent: Option<M> = match node.parent_id() {
            Some(parent) => Some(load_node(conn, self.config, &parent).await?),
            None => None,
        };
        self.adjust_node_with_parent(conn, &node, parent.as_ref())
            .await?;
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
        let Some(bounds) = self.bounds(&node) else {
            return Ok(());
        };

        let size = bounds.size();
        if size > 2 {
            let mut delete = M::Entity::delete_many()
                .filter(col(self.fields.left()).gt(bounds.left))
                .filter(col(self.fields.right()).lt(bounds.right));
            if let Some(scope) = self.scope_filter(bounds.scope.as_ref()) {
                delete = delete.filter(scope);
            }
            let removed = delete.exec(conn).await?.rows_affected;
            debug!(removed, "deleted nested set descendants");
        }

        self.synchronizer()
            .synchronize(
                conn,
                size,
                Direction::Backward,
                &ShiftCondition::greater_than(bounds.right).in_scope(bounds.scope.clone()),
                ShiftField::Both,
            )
            .await?;
        batch.mark_structure_changed();
        Ok(())
    }
}
