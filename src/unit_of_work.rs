//! Scheduling and flushing of tree writes.
//!
//! A [`UnitOfWork`] collects inserts, updates and deletes for one model and
//! flushes them in a single transaction, calling the configured strategy's
//! hooks around every row write.

use std::marker::PhantomData;

use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::{debug, info};

use crate::batch::BatchContext;
use crate::change_set::ChangeSet;
use crate::error::TreeError;
use crate::lock::LockedTransaction;
use crate::query::{col, find_node, load_node};
use crate::strategy::{Strategy, TreeStrategy};
use crate::traits::{id_value, resolve_metadata, TreeModel};

/// Handle to an insert scheduled on a [`UnitOfWork`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PendingNode(usize);

enum ParentRef {
    /// Whatever the active model's parent column holds.
    Staged,
    Pending(usize),
}

struct Insertion<M: TreeModel> {
    active: M::ActiveModel,
    parent: ParentRef,
}

/// Scheduled writes for one tree model.
pub struct UnitOfWork<M: TreeModel> {
    inserts: Vec<Insertion<M>>,
    updates: Vec<M::ActiveModel>,
    deletes: Vec<M::Id>,
    _marker: PhantomData<M>,
}

impl<M: TreeModel> Default for UnitOfWork<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: TreeModel> UnitOfWork<M> {
    pub fn new() -> Self {
        Self {
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Schedule an insert under the parent already set on `active`.
    pub fn persist(&mut self, active: M::ActiveModel) -> PendingNode {
        self.schedule(active, ParentRef::Staged)
    }

    /// Schedule an insert under a node persisted earlier in this unit of work.
    pub fn persist_under(&mut self, active: M::ActiveModel, parent: &PendingNode) -> PendingNode {
        self.schedule(active, ParentRef::Pending(parent.0))
    }

    fn schedule(&mut self, active: M::ActiveModel, parent: ParentRef) -> PendingNode {
        self.inserts.push(Insertion { active, parent });
        PendingNode(self.inserts.len() - 1)
    }

    /// Schedule an update; the primary key must be set on `active`.
    pub fn update(&mut self, active: M::ActiveModel) {
        self.updates.push(active);
    }

    /// Schedule moving `node` under `parent`, or to the top level.
    pub fn reparent(&mut self, node: &M, parent: Option<&M>) {
        let mut active = node.clone().into_active_model();
        M::set_parent(&mut active, parent.map(|parent| parent.id()));
        self.updates.push(active);
    }

    pub fn remove(&mut self, node: &M) {
        self.deletes.push(node.id());
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Flush every scheduled write in one transaction, holding the tree's
    /// advisory lock. Nothing is written if any step fails.
    pub async fn flush(self, db: &DatabaseConnection) -> Result<FlushOutcome<M>, TreeError> {
        let config = resolve_metadata::<M>()?;
        let guard = LockedTransaction::acquire(config.advisory_lock_strategy(), db).await?;

        match self.flush_on(guard.connection()).await {
            Ok(outcome) => {
                guard.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                guard.rollback().await?;
                Err(err)
            }
        }
    }

    /// Flush on a caller-managed connection or transaction. No lock is taken
    /// and nothing is rolled back on failure.
    pub async fn flush_on<C: ConnectionTrait>(self, conn: &C) -> Result<FlushOutcome<M>, TreeError> {
        let config = resolve_metadata::<M>()?;
        let strategy = Strategy::for_config(config);
        let mut batch = BatchContext::<M>::new();

        let mut inserted: Vec<M::Id> = Vec::with_capacity(self.inserts.len());
        for Insertion { mut active, parent } in self.inserts {
            let parent = match parent {
                ParentRef::Staged => M::active_parent(&active),
                ParentRef::Pending(index) => {
                    let parent = inserted.get(index).cloned().ok_or_else(|| {
                        TreeError::precondition(format!("pending parent #{index} was not inserted"))
                    })?;
                    M::set_parent(&mut active, Some(parent.clone()));
                    Some(parent)
                }
            };

            strategy
                .pre_insert(conn, &mut batch, &mut active, parent.as_ref())
                .await?;
            let node: M = active.insert(conn).await?;
            debug!(id = ?node.id(), parent = ?parent, "inserted tree node");
            strategy.post_insert(conn, &mut batch, &node).await?;
            inserted.push(node.id());
        }
        TreeStrategy::<M>::process_pending(&strategy, conn, &mut batch).await?;

        let updated = self.updates.len();
        for active in self.updates {
            let id = M::active_id(&active)
                .ok_or_else(|| TreeError::precondition("scheduled update without a primary key"))?;
            let stored: M = load_node(conn, config, &id).await?;
            let changes = ChangeSet::detect::<M>(config, &stored, &active)?;
            let _: M = active.update(conn).await?;
            if !changes.is_empty() {
                debug!(?id, changes = ?changes, "updated tree node");
            }
            strategy
                .scheduled_update(conn, &mut batch, &stored, &changes)
                .await?;
        }

        let mut deleted = 0;
        for id in self.deletes {
            // An earlier delete may already have taken the node with its subtree.
            let Some(stored) = find_node::<M, C>(conn, config, &id).await? else {
                continue;
            };
            strategy.scheduled_delete(conn, &mut batch, &stored).await?;
            M::Entity::delete_many()
                .filter(col(config.id_column()).eq(id_value::<M>(&id)))
                .exec(conn)
                .await?;
            deleted += 1;
        }

        strategy.flush_end(conn, batch).await?;

        let mut nodes = Vec::with_capacity(inserted.len());
        for id in &inserted {
            nodes.push(find_node::<M, C>(conn, config, id).await?);
        }
        info!(
            entity = config.entity_name(),
            strategy = %config.strategy(),
            inserted = inserted.len(),
            updated,
            deleted,
            "flushed tree changes"
        );
        Ok(FlushOutcome {
            inserted: nodes,
            updated,
            deleted,
        })
    }
}

/// Result of a flush.
#[derive(Clone, Debug)]
pub struct FlushOutcome<M: TreeModel> {
    inserted: Vec<Option<M>>,
    updated: usize,
    deleted: usize,
}

impl<M: TreeModel> FlushOutcome<M> {
    /// State of an inserted node after the flush; `None` if a later delete of
    /// the same flush removed it.
    pub fn get(&self, node: &PendingNode) -> Option<&M> {
        self.inserted.get(node.0).and_then(Option::as_ref)
    }

    pub fn inserted(&self) -> impl Iterator<Item = &M> {
        self.inserted.iter().flatten()
    }

    pub fn updated(&self) -> usize {
        self.updated
    }

    pub fn deleted(&self) -> usize {
        self.deleted
    }
}
