use std::collections::VecDeque;

use crate::error::TreeError;
use crate::traits::TreeModel;

/// A freshly inserted child whose interval is assigned once every insert of
/// the flush has been written.
#[derive(Clone, Debug)]
pub struct PendingInsert<M: TreeModel> {
    pub node: M::Id,
    pub parent: M::Id,
}

/// Transient state shared by the hooks of a single flush.
///
/// Created by [`crate::UnitOfWork::flush`], handed to every strategy hook
/// and consumed by `flush_end`.
#[derive(Debug)]
pub struct BatchContext<M: TreeModel> {
    pending: VecDeque<PendingInsert<M>>,
    tree_edge: Option<i64>,
    structure_changed: bool,
}

impl<M: TreeModel> Default for BatchContext<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: TreeModel> BatchContext<M> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            tree_edge: None,
            structure_changed: false,
        }
    }

    pub fn defer(&mut self, node: M::Id, parent: M::Id) {
        self.pending.push_back(PendingInsert { node, parent });
    }

    /// Next pending insert in submission order.
    pub fn next_pending(&mut self) -> Option<PendingInsert<M>> {
        self.pending.pop_front()
    }

    /// Highest right value handed out during this flush, if any.
    pub fn tree_edge(&self) -> Option<i64> {
        self.tree_edge
    }

    pub fn advance_edge(&mut self, edge: i64) {
        self.tree_edge = Some(self.tree_edge.map_or(edge, |current| current.max(edge)));
    }

    pub fn mark_structure_changed(&mut self) {
        self.structure_changed = true;
    }

    pub fn structure_changed(&self) -> bool {
        self.structure_changed
    }

    /// Close the batch. Leftover pending inserts mean a hook was skipped.
    pub fn finish(self) -> Result<(), TreeError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(TreeError::precondition(format!(
                "flush ended with {} unresolved pending insert(s)",
                self.pending.len()
            )))
        }
    }
}
