//! Bulk interval shifting for the nested set encoding.
//!
//! Every operation here is a single `UPDATE` over the node table; rows are
//! never loaded and written back one by one.

use sea_orm::sea_query::{Expr, Func, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, Value};
use tracing::debug;

use crate::config::NestedSetFields;
use crate::error::TreeError;
use crate::query::{bigint, col, execute, ident, table};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn apply(self, amount: i64) -> i64 {
        match self {
            Direction::Forward => amount,
            Direction::Backward => -amount,
        }
    }
}

/// Which boundary column(s) a shift rewrites.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShiftField {
    Left,
    Right,
    Both,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Comparison {
    Greater(i64),
    AtLeast(i64),
    Between(i64, i64),
}

/// `field <op> threshold`, evaluated against the column being shifted and
/// optionally restricted to one tree.
#[derive(Clone, Debug, PartialEq)]
pub struct ShiftCondition {
    comparison: Comparison,
    scope: Option<Value>,
}

impl ShiftCondition {
    pub fn greater_than(threshold: i64) -> Self {
        Self {
            comparison: Comparison::Greater(threshold),
            scope: None,
        }
    }

    pub fn at_least(threshold: i64) -> Self {
        Self {
            comparison: Comparison::AtLeast(threshold),
            scope: None,
        }
    }

    /// Inclusive range.
    pub fn between(low: i64, high: i64) -> Self {
        Self {
            comparison: Comparison::Between(low, high),
            scope: None,
        }
    }

    pub fn in_scope(mut self, scope: Option<Value>) -> Self {
        self.scope = scope;
        self
    }

    fn is_empty(&self) -> bool {
        matches!(self.comparison, Comparison::Between(low, high) if low > high)
    }

    fn expr(&self, column: &str) -> SimpleExpr {
        match self.comparison {
            Comparison::Greater(threshold) => col(column).gt(threshold),
            Comparison::AtLeast(threshold) => col(column).gte(threshold),
            Comparison::Between(low, high) => col(column).between(low, high),
        }
    }
}

/// A contiguous block of rows `[left, right]` inside one tree, moved rigidly.
#[derive(Clone, Debug, PartialEq)]
pub struct Subtree {
    pub left: i64,
    pub right: i64,
    pub scope: Option<Value>,
}

impl Subtree {
    pub fn size(&self) -> i64 {
        self.right - self.left + 1
    }
}

/// Bulk-shift primitive over the boundary columns of one node table.
#[derive(Clone, Copy, Debug)]
pub struct IntervalSynchronizer<'a> {
    table: &'a str,
    fields: &'a NestedSetFields,
}

impl<'a> IntervalSynchronizer<'a> {
    pub fn new(table: &'a str, fields: &'a NestedSetFields) -> Self {
        Self { table, fields }
    }

    fn scope_expr(&self, scope: Option<&Value>) -> Option<SimpleExpr> {
        match (self.fields.root(), scope) {
            (Some(root), Some(scope)) => Some(col(root).eq(scope.clone())),
            _ => None,
        }
    }

    /// Current tree edge: the highest right value, `0` for an empty tree.
    pub async fn max_boundary<C: ConnectionTrait>(
        &self,
        conn: &C,
        scope: Option<&Value>,
    ) -> Result<i64, TreeError> {
        let backend = conn.get_database_backend();
        let mut select = Query::select();
        select
            .expr(Func::cast_as(col(self.fields.right()).max(), bigint(backend)))
            .from(table(self.table));
        if let Some(scope) = self.scope_expr(scope) {
            select.and_where(scope);
        }

        let row = conn.query_one(backend.build(&select)).await?;
        let edge = match row {
            Some(row) => row.try_get_by_index::<Option<i64>>(0)?,
            None => None,
        };
        Ok(edge.unwrap_or(0))
    }

    /// Shift `field` by `amount` in `direction` on every row matching
    /// `condition`. `Both` issues one statement per column, left first.
    pub async fn synchronize<C: ConnectionTrait>(
        &self,
        conn: &C,
        amount: i64,
        direction: Direction,
        condition: &ShiftCondition,
        field: ShiftField,
    ) -> Result<u64, TreeError> {
        if amount == 0 || condition.is_empty() {
            return Ok(0);
        }

        let columns = match field {
            ShiftField::Left => vec![self.fields.left()],
            ShiftField::Right => vec![self.fields.right()],
            ShiftField::Both => vec![self.fields.left(), self.fields.right()],
        };

        let delta = direction.apply(amount);
        let mut affected = 0;
        for column in columns {
            let mut update = Query::update();
            update
                .table(table(self.table))
                .value(ident(column), col(column).add(delta))
                .and_where(condition.expr(column));
            if let Some(scope) = self.scope_expr(condition.scope.as_ref()) {
                update.and_where(scope);
            }
            let rows = execute(conn, &update).await?;
            debug!(
                table = self.table,
                column,
                delta,
                condition = ?condition.comparison,
                rows,
                "shifted nested set boundaries"
            );
            affected += rows;
        }
        Ok(affected)
    }

    /// Move `subtree` by `offset` in one statement, adjusting level and,
    /// when given, reassigning the rows to another tree.
    pub async fn relocate<C: ConnectionTrait>(
        &self,
        conn: &C,
        subtree: &Subtree,
        offset: i64,
        level_delta: i64,
        new_scope: Option<Value>,
    ) -> Result<u64, TreeError> {
        let left = self.fields.left();
        let right = self.fields.right();

        let mut update = Query::update();
        update.table(table(self.table));
        let mut touched = false;

        if offset != 0 {
            update
                .value(ident(left), col(left).add(offset))
                .value(ident(right), col(right).add(offset));
            touched = true;
        }
        if let Some(level) = self.fields.level() {
            if level_delta != 0 {
                update.value(ident(level), col(level).add(level_delta));
                touched = true;
            }
        }
        if let (Some(root), Some(scope)) = (self.fields.root(), new_scope) {
            update.value(ident(root), Expr::val(scope));
            touched = true;
        }
        if !touched {
            return Ok(0);
        }

        update
            .and_where(col(left).gte(subtree.left))
            .and_where(col(right).lte(subtree.right));
        if let Some(scope) = self.scope_expr(subtree.scope.as_ref()) {
            update.and_where(scope);
        }

        let rows = execute(conn, &update).await?;
        debug!(
            table = self.table,
            left = subtree.left,
            right = subtree.right,
            offset,
            level_delta,
            rows,
            "relocated nested set subtree"
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::{DatabaseConnection, DbBackend, MockDatabase, MockExecResult};

    use super::*;
    use crate::config::{StrategyKind, TreeLayout, TreeOptions};

    fn fields(root: bool) -> NestedSetFields {
        let mut options = TreeOptions::default()
            .strategy(StrategyKind::NestedSet)
            .level_column("lvl");
        if root {
            options = options.root_column("tree_root");
        }
        match options.build("Category", "categories").unwrap().layout() {
            TreeLayout::NestedSet(fields) => fields.clone(),
            _ => unreachable!(),
        }
    }

    fn mock(results: usize) -> DatabaseConnection {
        MockDatabase::new(DbBackend::Postgres)
            .append_exec_results((0..results).map(|_| MockExecResult {
                last_insert_id: 0,
                rows_affected: 3,
            }))
            .into_connection()
    }

    #[tokio::test]
    async fn both_boundaries_shift_with_one_statement_each() {
        let fields = fields(false);
        let db = mock(2);
        let sync = IntervalSynchronizer::new("categories", &fields);

        let affected = sync
            .synchronize(
                &db,
                2,
                Direction::Forward,
                &ShiftCondition::at_least(5),
                ShiftField::Both,
            )
            .await
            .unwrap();
        assert_eq!(affected, 6);

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 2);
        let rendered = format!("{log:?}");
        assert_eq!(rendered.matches("UPDATE").count(), 2);
        assert!(rendered.contains("lft"));
        assert!(rendered.contains("rgt"));
    }

    #[tokio::test]
    async fn empty_shifts_issue_no_statement() {
        let fields = fields(false);
        let db = mock(0);
        let sync = IntervalSynchronizer::new("categories", &fields);

        let zero = sync
            .synchronize(
                &db,
                0,
                Direction::Backward,
                &ShiftCondition::greater_than(4),
                ShiftField::Both,
            )
            .await
            .unwrap();
        let inverted = sync
            .synchronize(
                &db,
                2,
                Direction::Backward,
                &ShiftCondition::between(9, 8),
                ShiftField::Left,
            )
            .await
            .unwrap();
        let still = sync
            .relocate(
                &db,
                &Subtree {
                    left: 2,
                    right: 5,
                    scope: None,
                },
                0,
                0,
                None,
            )
            .await
            .unwrap();

        assert_eq!((zero, inverted, still), (0, 0, 0));
        assert!(db.into_transaction_log().is_empty());
    }

    #[tokio::test]
    async fn failed_shift_is_raised() {
        let fields = fields(false);
        let db = mock(0);
        let sync = IntervalSynchronizer::new("categories", &fields);

        let err = sync
            .synchronize(
                &db,
                2,
                Direction::Forward,
                &ShiftCondition::at_least(1),
                ShiftField::Right,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Database(_)));
    }

    #[tokio::test]
    async fn relocation_rewrites_every_column_at_once() {
        let fields = fields(true);
        let db = mock(1);
        let sync = IntervalSynchronizer::new("categories", &fields);

        sync.relocate(
            &db,
            &Subtree {
                left: 4,
                right: 7,
                scope: Some(Value::from(1)),
            },
            -3,
            -1,
            Some(Value::from(9)),
        )
        .await
        .unwrap();

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 1);
        let rendered = format!("{log:?}");
        for column in ["lft", "rgt", "lvl", "tree_root"] {
            assert!(rendered.contains(column), "{column} missing from {rendered}");
        }
    }
}
