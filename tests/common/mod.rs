#![allow(dead_code)]

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Statement};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A private in-memory SQLite database with `schema` applied.
///
/// The pool holds a single connection: every connection to `sqlite::memory:`
/// opens a database of its own.
pub async fn sqlite(schema: &[&str]) -> Result<DatabaseConnection, DbErr> {
    init_tracing();

    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    for statement in schema {
        execute(&db, statement).await?;
    }
    Ok(db)
}

pub async fn execute(db: &DatabaseConnection, sql: &str) -> Result<(), DbErr> {
    db.execute(Statement::from_string(DbBackend::Sqlite, sql)).await?;
    Ok(())
}
