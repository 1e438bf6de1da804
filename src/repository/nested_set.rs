use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use sea_orm::sea_query::{Expr, Keyword, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Value};
use tracing::{debug, info};

use super::{finish, TreeRepository};
use crate::error::TreeError;
use crate::query::{col, col_expr, execute, ident, load_node, table};
use crate::strategy::{Direction, NestedSet, ShiftCondition, ShiftField, Subtree};
use crate::traits::{id_value, TreeModel};
use crate::value::{as_i64, as_string, is_null, scope_key};

/// A structural problem found by [`TreeRepository::verify`].
#[derive(Clone, Debug, PartialEq)]
pub enum VerificationIssue<Id> {
    MissingIndex { scope: Option<String>, index: i64 },
    DuplicateIndex { scope: Option<String>, index: i64 },
    InvalidInterval { node: Id, left: i64, right: i64 },
    MissingParent { node: Id, parent: Id },
    OutsideParent { node: Id, parent: Id },
    WrongLevel { node: Id, expected: i64, actual: i64 },
    Overlap { node: Id, other: Id },
}

impl<Id: fmt::Debug> fmt::Display for VerificationIssue<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = |scope: &Option<String>| match scope {
            Some(scope) => format!(" in tree {scope}"),
            None => String::new(),
        };
        match self {
            VerificationIssue::MissingIndex { scope: s, index } => {
                write!(f, "index {index} is missing{}", scope(s))
            }
            VerificationIssue::DuplicateIndex { scope: s, index } => {
                write!(f, "index {index} is used more than once{}", scope(s))
            }
            VerificationIssue::InvalidInterval { node, left, right } => {
                write!(f, "node {node:?} has left {left} not below right {right}")
            }
            VerificationIssue::MissingParent { node, parent } => {
                write!(f, "node {node:?} references missing parent {parent:?}")
            }
            VerificationIssue::OutsideParent { node, parent } => {
                write!(f, "node {node:?} lies outside its parent {parent:?}")
            }
            VerificationIssue::WrongLevel {
                node,
                expected,
                actual,
            } => write!(f, "node {node:?} has level {actual}, expected {expected}"),
            VerificationIssue::Overlap { node, other } => {
                write!(f, "node {node:?} partially overlaps {other:?}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Null,
    Int(i64),
    Text(String),
}

impl SortKey {
    fn of(value: &Value) -> Self {
        if is_null(value) {
            SortKey::Null
        } else if let Some(int) = as_i64(value) {
            SortKey::Int(int)
        } else {
            SortKey::Text(as_string(value).unwrap_or_else(|| format!("{value:?}")))
        }
    }
}

/// Stored boundary values, read without any validation.
#[derive(Clone, Debug, PartialEq)]
struct RawBounds {
    left: i64,
    right: i64,
    level: Option<i64>,
    scope: Option<String>,
}

fn raw_bounds<M: TreeModel>(nested: &NestedSet<'_>, node: &M) -> RawBounds {
    let fields = nested.fields();
    let int = |field: &str| node.field_value(field).as_ref().and_then(as_i64);
    RawBounds {
        left: int(fields.left()).unwrap_or(0),
        right: int(fields.right()).unwrap_or(0),
        level: fields.level().and_then(int),
        scope: fields
            .root()
            .and_then(|root| node.field_value(root))
            .filter(|value| !is_null(value))
            .map(|value| scope_key(&value)),
    }
}

#[derive(Clone, Debug)]
struct Placement<Id> {
    id: Id,
    left: i64,
    right: i64,
    level: i64,
    scope: Option<Value>,
}

/// Parent/children relation of a set of loaded rows, children kept in
/// their current interval order.
struct Forest<M: TreeModel> {
    nodes: HashMap<M::Id, M>,
    roots: Vec<M::Id>,
    children: HashMap<M::Id, Vec<M::Id>>,
}

impl<M: TreeModel> Forest<M> {
    fn build(nested: &NestedSet<'_>, mut rows: Vec<M>) -> Self {
        // Rows without an interval go last, in id order.
        rows.sort_by_key(|row| {
            let left = raw_bounds(nested, row).left;
            if left > 0 {
                left
            } else {
                i64::MAX
            }
        });

        let ids: HashSet<M::Id> = rows.iter().map(|row| row.id()).collect();
        let mut roots = Vec::new();
        let mut children: HashMap<M::Id, Vec<M::Id>> = HashMap::new();
        for row in &rows {
            match row.parent_id().filter(|parent| ids.contains(parent)) {
                Some(parent) => children.entry(parent).or_default().push(row.id()),
                None => roots.push(row.id()),
            }
        }

        Self {
            nodes: rows.into_iter().map(|row| (row.id(), row)).collect(),
            roots,
            children,
        }
    }

    fn sort_children(
        &mut self,
        parent: Option<&M::Id>,
        keys: &HashMap<M::Id, SortKey>,
        ascending: bool,
        recursive: bool,
    ) {
        let compare = |a: &M::Id, b: &M::Id| {
            let ordering = keys.get(a).cmp(&keys.get(b));
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        };

        let mut pending: Vec<M::Id> = match parent {
            Some(parent) => {
                if let Some(children) = self.children.get_mut(parent) {
                    children.sort_by(compare);
                }
                self.children.get(parent).cloned().unwrap_or_default()
            }
            None => {
                self.roots.sort_by(compare);
                self.roots.clone()
            }
        };
        if !recursive {
            return;
        }
        while let Some(id) = pending.pop() {
            if let Some(children) = self.children.get_mut(&id) {
                children.sort_by(compare);
                pending.extend(children.iter().cloned());
            }
        }
    }

    /// Pre-order layout of the subtree at `id` starting at `left`; returns
    /// the subtree's right boundary.
    fn place(
        &self,
        id: &M::Id,
        left: i64,
        level: i64,
        scope: &Option<Value>,
        out: &mut Vec<Placement<M::Id>>,
    ) -> i64 {
        let index = out.len();
        out.push(Placement {
            id: id.clone(),
            left,
            right: left + 1,
            level,
            scope: scope.clone(),
        });
        let mut next = left + 1;
        if let Some(children) = self.children.get(id) {
            for child in children {
                next = self.place(child, next, level + 1, scope, out) + 1;
            }
        }
        out[index].right = next;
        next
    }
}

impl<M> TreeRepository<M>
where
    M: TreeModel,
{
    /// Swap `node` with its previous sibling up to `steps` times (`None`:
    /// as far as possible). Returns the number of positions moved.
    pub async fn move_up(
        &self,
        db: &DatabaseConnection,
        node: &M,
        steps: Option<u32>,
    ) -> Result<u32, TreeError> {
        let nested = self.nested_set("move_up")?;
        if steps == Some(0) {
            return Ok(0);
        }
        let guard = self.lock(db).await?;
        let result = self
            .move_among_siblings(guard.connection(), nested, node, steps, Direction::Backward)
            .await;
        finish(guard, result).await
    }

    /// Swap `node` with its next sibling up to `steps` times (`None`: as
    /// far as possible). Returns the number of positions moved.
    pub async fn move_down(
        &self,
        db: &DatabaseConnection,
        node: &M,
        steps: Option<u32>,
    ) -> Result<u32, TreeError> {
        let nested = self.nested_set("move_down")?;
        if steps == Some(0) {
            return Ok(0);
        }
        let guard = self.lock(db).await?;
        let result = self
            .move_among_siblings(guard.connection(), nested, node, steps, Direction::Forward)
            .await;
        finish(guard, result).await
    }

    async fn move_among_siblings<C: ConnectionTrait>(
        &self,
        conn: &C,
        nested: NestedSet<'static>,
        node: &M,
        steps: Option<u32>,
        direction: Direction,
    ) -> Result<u32, TreeError> {
        let config = self.config()?;
        let fields = nested.fields();
        let mut moved = 0;

        while steps.map_or(true, |steps| moved < steps) {
            let current: M = load_node(conn, config, &node.id()).await?;
            let bounds = nested.bounds(&current).ok_or_else(|| {
                TreeError::precondition(format!("node {:?} has no interval", current.id()))
            })?;

            let adjacent = match direction {
                Direction::Backward => col(fields.right()).eq(bounds.left - 1),
                Direction::Forward => col(fields.left()).eq(bounds.right + 1),
            };
            let mut query = M::Entity::find().filter(adjacent);
            if let Some(scope) = nested.scope_filter(bounds.scope.as_ref()) {
                query = query.filter(scope);
            }
            let Some(sibling) = query.one(conn).await? else {
                break;
            };
            let Some(sibling) = nested.bounds(&sibling) else {
                break;
            };

            match direction {
                Direction::Backward => nested.swap_adjacent(conn, &sibling, &bounds).await?,
                Direction::Forward => nested.swap_adjacent(conn, &bounds, &sibling).await?,
            }
            moved += 1;
        }

        debug!(id = ?node.id(), moved, ?direction, "moved node among its siblings");
        Ok(moved)
    }

    /// Reorder the children of `parent` (the roots when `None`) by `field`,
    /// and with `recursive` every level below as well.
    pub async fn reorder(
        &self,
        db: &DatabaseConnection,
        parent: Option<&M>,
        field: &str,
        ascending: bool,
        recursive: bool,
    ) -> Result<u64, TreeError> {
        let nested = self.nested_set("reorder")?;
        if parent.is_none() && nested.fields().root().is_some() {
            return Err(TreeError::precondition(
                "roots of separately scoped trees have no order",
            ));
        }
        let guard = self.lock(db).await?;
        let result = self
            .reorder_on(guard.connection(), nested, parent, field, ascending, recursive)
            .await;
        finish(guard, result).await
    }

    async fn reorder_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        nested: NestedSet<'static>,
        parent: Option<&M>,
        field: &str,
        ascending: bool,
        recursive: bool,
    ) -> Result<u64, TreeError> {
        let config = self.config()?;
        let fields = nested.fields();

        let (rows, anchor) = match parent {
            Some(parent) => {
                let parent: M = load_node(conn, config, &parent.id()).await?;
                let bounds = nested.bounds(&parent).ok_or_else(|| {
                    TreeError::precondition(format!("node {:?} has no interval", parent.id()))
                })?;
                let mut query = M::Entity::find()
                    .filter(col(fields.left()).gte(bounds.left))
                    .filter(col(fields.right()).lte(bounds.right));
                if let Some(scope) = nested.scope_filter(bounds.scope.as_ref()) {
                    query = query.filter(scope);
                }
                (query.all(conn).await?, Some((parent.id(), bounds)))
            }
            None => (M::Entity::find().all(conn).await?, None),
        };

        let mut keys = HashMap::with_capacity(rows.len());
        for row in &rows {
            let value = row
                .field_value(field)
                .ok_or_else(|| TreeError::UnknownField(field.to_string()))?;
            keys.insert(row.id(), SortKey::of(&value));
        }

        let mut forest = Forest::<M>::build(&nested, rows);
        let mut placements = Vec::with_capacity(forest.nodes.len());
        match anchor {
            Some((id, bounds)) => {
                forest.sort_children(Some(&id), &keys, ascending, recursive);
                forest.place(
                    &id,
                    bounds.left,
                    bounds.level.unwrap_or(0),
                    &bounds.scope,
                    &mut placements,
                );
            }
            None => {
                forest.sort_children(None, &keys, ascending, recursive);
                let mut next = 1;
                for root in &forest.roots {
                    next = forest.place(root, next, 0, &None, &mut placements) + 1;
                }
            }
        }

        let written = self.apply_placements(conn, &nested, &forest, &placements).await?;
        info!(entity = config.entity_name(), field, written, "reordered nested set");
        Ok(written)
    }

    /// Check the stored intervals against each other and against the parent
    /// references.
    pub async fn verify<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<Vec<VerificationIssue<M::Id>>, TreeError> {
        let nested = self.nested_set("verify")?;
        let config = self.config()?;
        let rows = M::Entity::find()
            .order_by_asc(col_expr(config.id_column()))
            .all(conn)
            .await?;

        let bounds: HashMap<M::Id, RawBounds> = rows
            .iter()
            .map(|row| (row.id(), raw_bounds(&nested, row)))
            .collect();
        let has_level = nested.fields().level().is_some();
        let mut issues = Vec::new();

        for row in &rows {
            let id = row.id();
            let own = &bounds[&id];
            if own.left >= own.right {
                issues.push(VerificationIssue::InvalidInterval {
                    node: id.clone(),
                    left: own.left,
                    right: own.right,
                });
            }

            let expected_level = match row.parent_id() {
                None => Some(0),
                Some(parent) => match bounds.get(&parent) {
                    None => {
                        issues.push(VerificationIssue::MissingParent {
                            node: id.clone(),
                            parent,
                        });
                        None
                    }
                    Some(above) => {
                        let inside = above.scope == own.scope
                            && above.left < own.left
                            && own.right < above.right;
                        if !inside {
                            issues.push(VerificationIssue::OutsideParent {
                                node: id.clone(),
                                parent: parent.clone(),
                            });
                        }
                        above.level.map(|level| level + 1)
                    }
                },
            };
            if let (true, Some(expected), Some(actual)) = (has_level, expected_level, own.level) {
                if expected != actual {
                    issues.push(VerificationIssue::WrongLevel {
                        node: id,
                        expected,
                        actual,
                    });
                }
            }
        }

        let mut scopes: BTreeMap<Option<String>, Vec<(&M::Id, &RawBounds)>> = BTreeMap::new();
        for row in &rows {
            let id = &row.id();
            let (id, own) = bounds
                .get_key_value(id)
                .ok_or_else(|| TreeError::invariant("verified row vanished"))?;
            scopes.entry(own.scope.clone()).or_default().push((id, own));
        }

        for (scope, members) in scopes {
            let mut seen: HashMap<i64, usize> = HashMap::new();
            for (_, own) in &members {
                *seen.entry(own.left).or_default() += 1;
                *seen.entry(own.right).or_default() += 1;
            }
            let highest = 2 * members.len() as i64;
            for index in 1..=highest {
                match seen.get(&index).copied().unwrap_or(0) {
                    0 => issues.push(VerificationIssue::MissingIndex {
                        scope: scope.clone(),
                        index,
                    }),
                    1 => {}
                    _ => issues.push(VerificationIssue::DuplicateIndex {
                        scope: scope.clone(),
                        index,
                    }),
                }
            }

            let mut sorted: Vec<_> = members
                .into_iter()
                .filter(|(_, own)| own.left < own.right)
                .collect();
            sorted.sort_by_key(|(_, own)| own.left);
            let mut open: Vec<(&M::Id, &RawBounds)> = Vec::new();
            for (id, own) in sorted {
                while open.last().is_some_and(|(_, top)| top.right < own.left) {
                    open.pop();
                }
                if let Some((other, top)) = open.last() {
                    if own.right > top.right {
                        issues.push(VerificationIssue::Overlap {
                            node: id.clone(),
                            other: (*other).clone(),
                        });
                        continue;
                    }
                }
                open.push((id, own));
            }
        }

        Ok(issues)
    }

    pub async fn is_valid<C: ConnectionTrait>(&self, conn: &C) -> Result<bool, TreeError> {
        Ok(self.verify(conn).await?.is_empty())
    }

    /// Recompute every interval (and level and root) from the parent
    /// references, keeping the current sibling order. Returns the number of
    /// rows rewritten.
    pub async fn recover(&self, db: &DatabaseConnection) -> Result<u64, TreeError> {
        let nested = self.nested_set("recover")?;
        let guard = self.lock(db).await?;
        let result = self.recover_on(guard.connection(), nested).await;
        finish(guard, result).await
    }

    async fn recover_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        nested: NestedSet<'static>,
    ) -> Result<u64, TreeError> {
        let config = self.config()?;
        let rows = M::Entity::find()
            .order_by_asc(col_expr(config.id_column()))
            .all(conn)
            .await?;
        let forest = Forest::<M>::build(&nested, rows);

        let mut placements = Vec::with_capacity(forest.nodes.len());
        let scoped = nested.fields().root().is_some();
        let mut next = 1;
        for root in &forest.roots {
            if scoped {
                forest.place(root, 1, 0, &Some(id_value::<M>(root)), &mut placements);
            } else {
                next = forest.place(root, next, 0, &None, &mut placements) + 1;
            }
        }
        if placements.len() != forest.nodes.len() {
            return Err(TreeError::invariant(format!(
                "{} node(s) are not reachable from any root",
                forest.nodes.len() - placements.len()
            )));
        }

        let written = self.apply_placements(conn, &nested, &forest, &placements).await?;
        info!(entity = config.entity_name(), written, "recovered nested set");
        Ok(written)
    }

    async fn apply_placements<C: ConnectionTrait>(
        &self,
        conn: &C,
        nested: &NestedSet<'static>,
        forest: &Forest<M>,
        placements: &[Placement<M::Id>],
    ) -> Result<u64, TreeError> {
        let has_level = nested.fields().level().is_some();
        let mut written = 0;
        for placement in placements {
            let Some(row) = forest.nodes.get(&placement.id) else {
                continue;
            };
            let current = raw_bounds(nested, row);
            let unchanged = current.left == placement.left
                && current.right == placement.right
                && (!has_level || current.level == Some(placement.level))
                && current.scope.as_ref().map(String::as_str)
                    == placement.scope.as_ref().map(scope_key).as_deref();
            if unchanged {
                continue;
            }
            nested
                .assign::<M, C>(
                    conn,
                    &placement.id,
                    placement.left,
                    placement.right,
                    Some(placement.level),
                    placement.scope.clone(),
                )
                .await?;
            written += 1;
        }
        Ok(written)
    }

    /// Delete `node` alone, promoting its children to its parent.
    pub async fn remove_from_tree(&self, db: &DatabaseConnection, node: &M) -> Result<(), TreeError> {
        let nested = self.nested_set("remove_from_tree")?;
        let guard = self.lock(db).await?;
        let result = self.remove_from_tree_on(guard.connection(), nested, node).await;
        finish(guard, result).await
    }

    async fn remove_from_tree_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        nested: NestedSet<'static>,
        node: &M,
    ) -> Result<(), TreeError> {
        let config = self.config()?;
        let fields = nested.fields();
        let sync = nested.synchronizer();
        let node: M = load_node(conn, config, &node.id()).await?;
        let id = node.id();
        let bounds = nested
            .bounds(&node)
            .ok_or_else(|| TreeError::precondition(format!("node {id:?} has no interval")))?;
        let parent = node.parent_id();
        let splits_tree = parent.is_none() && fields.root().is_some();

        if splits_tree {
            // Every child becomes a tree of its own.
            let children = M::Entity::find()
                .filter(col(config.parent_column()).eq(id_value::<M>(&id)))
                .order_by_asc(col_expr(fields.left()))
                .all(conn)
                .await?;
            for child in &children {
                let Some(child_bounds) = nested.bounds(child) else {
                    continue;
                };
                let subtree = Subtree {
                    left: child_bounds.left,
                    right: child_bounds.right,
                    scope: child_bounds.scope.clone(),
                };
                sync.relocate(
                    conn,
                    &subtree,
                    1 - child_bounds.left,
                    -1,
                    Some(id_value::<M>(&child.id())),
                )
                .await?;
            }
        } else if bounds.size() > 2 {
            let inner = Subtree {
                left: bounds.left + 1,
                right: bounds.right - 1,
                scope: bounds.scope.clone(),
            };
            sync.relocate(conn, &inner, -1, -1, None).await?;
        }

        let new_parent: SimpleExpr = match &parent {
            Some(parent) => Expr::val(id_value::<M>(parent)).into(),
            None => SimpleExpr::Keyword(Keyword::Null),
        };
        let mut update = Query::update();
        update
            .table(table(config.table()))
            .value(ident(config.parent_column()), new_parent)
            .and_where(col(config.parent_column()).eq(id_value::<M>(&id)));
        let promoted = execute(conn, &update).await?;

        M::Entity::delete_many()
            .filter(col(config.id_column()).eq(id_value::<M>(&id)))
            .exec(conn)
            .await?;

        if !splits_tree {
            sync.synchronize(
                conn,
                2,
                Direction::Backward,
                &ShiftCondition::greater_than(bounds.right).in_scope(bounds.scope.clone()),
                ShiftField::Both,
            )
            .await?;
        }
        debug!(?id, promoted, "removed node from tree");
        Ok(())
    }
}
