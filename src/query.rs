//! Statement helpers shared by the strategies and the repository.

use sea_orm::sea_query::{Alias, BinOper, Expr, Func, LikeExpr, SimpleExpr};
use sea_orm::{ConnectionTrait, DbBackend, EntityTrait, QueryFilter, StatementBuilder};

use crate::config::TreeConfig;
use crate::error::TreeError;
use crate::traits::{id_value, TreeModel};

pub(crate) fn col(name: &str) -> Expr {
    Expr::col(Alias::new(name))
}

pub(crate) fn col_expr(name: &str) -> SimpleExpr {
    col(name).into()
}

pub(crate) fn table(name: &str) -> Alias {
    Alias::new(name)
}

pub(crate) fn ident(name: &str) -> Alias {
    Alias::new(name)
}

/// Target type used to read integer aggregates back as `i64` on every backend.
pub(crate) fn bigint(backend: DbBackend) -> Alias {
    match backend {
        DbBackend::MySql => Alias::new("SIGNED"),
        _ => Alias::new("BIGINT"),
    }
}

pub(crate) fn quote(backend: DbBackend, identifier: &str) -> String {
    match backend {
        DbBackend::MySql => format!("`{identifier}`"),
        _ => format!("\"{identifier}\""),
    }
}

fn substr(column: &str, start: i32, len: Option<i32>) -> SimpleExpr {
    let call = Func::cust(Alias::new("SUBSTR")).arg(col_expr(column)).arg(start);
    match len {
        Some(len) => call.arg(len).into(),
        None => call.into(),
    }
}

fn char_len(text: &str) -> Result<i32, TreeError> {
    i32::try_from(text.chars().count()).map_err(|_| TreeError::invariant("path prefix too long"))
}

/// Rows whose `column` starts with `prefix`, compared case-sensitively.
///
/// The `LIKE` narrows the scan; the `SUBSTR` equality rejects rows a
/// case-insensitive `LIKE` lets through.
pub(crate) fn starts_with(column: &str, prefix: &str) -> Result<SimpleExpr, TreeError> {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    let head = substr(column, 1, Some(char_len(prefix)?));
    Ok(col(column)
        .like(LikeExpr::new(pattern).escape('\\'))
        .and(Expr::expr(head).eq(prefix.to_string())))
}

/// `new_prefix || SUBSTR(column, len(old_prefix) + 1)`, `CONCAT` on MySQL.
pub(crate) fn replace_prefix(
    backend: DbBackend,
    column: &str,
    old_prefix: &str,
    new_prefix: &str,
) -> Result<SimpleExpr, TreeError> {
    let head: SimpleExpr = Expr::val(new_prefix.to_string()).into();
    let tail = substr(column, char_len(old_prefix)? + 1, None);
    Ok(match backend {
        DbBackend::MySql => Func::cust(Alias::new("CONCAT")).arg(head).arg(tail).into(),
        _ => SimpleExpr::Binary(Box::new(head), BinOper::Custom("||"), Box::new(tail)),
    })
}

pub(crate) async fn execute<C, S>(conn: &C, statement: &S) -> Result<u64, TreeError>
where
    C: ConnectionTrait,
    S: StatementBuilder,
{
    let statement = conn.get_database_backend().build(statement);
    let result = conn.execute(statement).await?;
    Ok(result.rows_affected())
}

pub(crate) async fn find_node<M, C>(
    conn: &C,
    config: &TreeConfig,
    id: &M::Id,
) -> Result<Option<M>, TreeError>
where
    M: TreeModel,
    C: ConnectionTrait,
{
    let node = M::Entity::find()
        .filter(col(config.id_column()).eq(id_value::<M>(id)))
        .one(conn)
        .await?;
    Ok(node)
}

pub(crate) async fn load_node<M, C>(conn: &C, config: &TreeConfig, id: &M::Id) -> Result<M, TreeError>
where
    M: TreeModel,
    C: ConnectionTrait,
{
    find_node::<M, C>(conn, config, id)
        .await?
        .ok_or_else(|| TreeError::not_found(id))
}
