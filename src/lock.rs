//! Transaction guard serialising structural writers of one tree.

use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, Statement,
    TransactionTrait, Value,
};
use tracing::{debug, warn};

use crate::config::AdvisoryLockStrategy;
use crate::error::TreeError;

/// A transaction holding the tree's advisory lock, when the backend has one.
///
/// SQLite has no advisory locks; its writers are already serialised by the
/// database lock taken by the first write of the transaction.
pub struct LockedTransaction {
    txn: DatabaseTransaction,
    key: Option<String>,
}

impl LockedTransaction {
    pub async fn acquire(
        strategy: &AdvisoryLockStrategy,
        db: &DatabaseConnection,
    ) -> Result<Self, TreeError> {
        let backend = db.get_database_backend();
        let key = match (strategy, backend) {
            (AdvisoryLockStrategy::Disabled, _) | (_, DbBackend::Sqlite) => None,
            (AdvisoryLockStrategy::Namespaced(key), _) => Some(key.as_str().to_owned()),
        };

        let txn = db.begin().await?;

        if let Some(key) = &key {
            if let Err(err) = acquire_lock(&txn, key).await {
                let _ = txn.rollback().await;
                return Err(err);
            }
            debug!(key, "acquired tree advisory lock");
        }

        Ok(Self { txn, key })
    }

    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub async fn commit(self) -> Result<(), TreeError> {
        if let Some(key) = &self.key {
            release_lock(&self.txn, key).await?;
        }
        self.txn.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), TreeError> {
        if let Some(key) = &self.key {
            if let Err(err) = release_lock(&self.txn, key).await {
                warn!(key, error = %err, "failed to release tree advisory lock");
            }
        }
        self.txn.rollback().await?;
        Ok(())
    }
}

async fn acquire_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), TreeError> {
    let backend = txn.get_database_backend();
    let sql = match backend {
        DbBackend::MySql => "SELECT GET_LOCK(?, -1)",
        _ => "SELECT pg_advisory_lock(hashtext($1), 0)",
    };
    txn.execute(Statement::from_sql_and_values(backend, sql, vec![Value::from(key)]))
        .await?;
    Ok(())
}

async fn release_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), TreeError> {
    let backend = txn.get_database_backend();
    let sql = match backend {
        DbBackend::MySql => "SELECT RELEASE_LOCK(?)",
        _ => "SELECT pg_advisory_unlock(hashtext($1), 0)",
    };
    txn.execute(Statement::from_sql_and_values(backend, sql, vec![Value::from(key)]))
        .await?;
    Ok(())
}
