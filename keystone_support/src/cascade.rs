// Deferred work queue for collapse cascades.
//
// When a node's value changes, every structure registered on it has to be
// re-evaluated, and any that fall unregister from their own nodes, which
// changes more values. Doing that by calling straight back into structures
// from inside the notification would mutate registration lists while they
// are being walked, and would recurse as deep as the building is tall.
//
// Instead the operation that started the change owns a `CascadeQueue`:
//
//   1. Node value changes `notify()` the queue with `(structure, point,
//      node)`. A structure already waiting gets the point appended to its
//      pending change set instead of a second queue slot.
//   2. The network's drain loop `pop()`s structures in first-notified
//      order, hands each its whole change set, and collapses it if needed.
//   3. A collapsing structure is `forget()`-ed, so any entry still pointing
//      at it resolves to nothing instead of a dangling handle.
//
// The loop runs until the queue is empty before control returns to the
// caller. Values only fall during a removal cascade, so the loop always
// terminates: each round either empties the queue or removes a structure.
//
// `CascadeReport` records what the drain did: the order structures were
// evaluated in and which ones collapsed.
//
// See also: `network.rs` for the drain loop and `structure.rs` for the
// per-structure handlers.
//
// **Critical constraint: determinism.** Pending sets live in a `BTreeMap`
// and the order is a FIFO `VecDeque`; no hash iteration.

use crate::types::{NodeId, StructureId};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};

/// Changed points reported for one structure, `(point, node)`.
pub type ChangeSet = SmallVec<[(usize, NodeId); 4]>;

/// FIFO of structures with pending support changes, one slot per structure.
#[derive(Debug, Default)]
pub struct CascadeQueue {
    order: VecDeque<StructureId>,
    pending: BTreeMap<StructureId, ChangeSet>,
}

impl CascadeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node`, bound to `structure`'s `point`, changed value.
    pub fn notify(&mut self, structure: StructureId, point: usize, node: NodeId) {
        let changes = self.pending.entry(structure).or_insert_with(|| {
            self.order.push_back(structure);
            ChangeSet::new()
        });
        if !changes.contains(&(point, node)) {
            changes.push((point, node));
        }
    }

    /// Next structure to evaluate together with everything that changed
    /// under it since it was queued.
    pub fn pop(&mut self) -> Option<(StructureId, ChangeSet)> {
        while let Some(structure) = self.order.pop_front() {
            if let Some(changes) = self.pending.remove(&structure) {
                return Some((structure, changes));
            }
        }
        None
    }

    /// Drop pending work for a structure that no longer exists.
    pub fn forget(&mut self, structure: StructureId) {
        self.pending.remove(&structure);
    }

    pub fn is_pending(&self, structure: StructureId) -> bool {
        self.pending.contains_key(&structure)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What one triggering operation's cascade did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    /// Structures evaluated by the drain loop, in order.
    pub evaluated: Vec<StructureId>,
    /// Structures that lost support and fell, in order. Does not include a
    /// structure removed directly by the caller.
    pub collapsed: Vec<StructureId>,
    /// Nodes destroyed because their last registration went away (or
    /// severed by the caller), in order.
    pub nodes_destroyed: Vec<NodeId>,
}

impl CascadeReport {
    pub fn is_quiet(&self) -> bool {
        self.collapsed.is_empty() && self.nodes_destroyed.is_empty()
    }

    /// Fold another report into this one, preserving order.
    pub fn merge(&mut self, other: CascadeReport) {
        self.evaluated.extend(other.evaluated);
        self.collapsed.extend(other.collapsed);
        self.nodes_destroyed.extend(other.nodes_destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_slot_per_structure() {
        let mut q = CascadeQueue::new();
        q.notify(StructureId(2), 0, NodeId(1));
        q.notify(StructureId(1), 0, NodeId(1));
        q.notify(StructureId(2), 1, NodeId(5));
        q.notify(StructureId(2), 1, NodeId(5));
        assert_eq!(q.len(), 2);

        let (s, changes) = q.pop().unwrap();
        assert_eq!(s, StructureId(2));
        assert_eq!(changes.as_slice(), &[(0, NodeId(1)), (1, NodeId(5))]);
        assert_eq!(q.pop().unwrap().0, StructureId(1));
        assert!(q.pop().is_none());
    }

    #[test]
    fn forgotten_structures_are_skipped() {
        let mut q = CascadeQueue::new();
        q.notify(StructureId(1), 0, NodeId(1));
        q.notify(StructureId(2), 0, NodeId(1));
        q.forget(StructureId(1));
        assert!(!q.is_pending(StructureId(1)));
        assert_eq!(q.pop().unwrap().0, StructureId(2));
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_after_pop() {
        let mut q = CascadeQueue::new();
        q.notify(StructureId(1), 0, NodeId(1));
        assert!(q.pop().is_some());
        q.notify(StructureId(1), 0, NodeId(2));
        let (_, changes) = q.pop().unwrap();
        assert_eq!(changes.as_slice(), &[(0, NodeId(2))]);
    }

    #[test]
    fn forget_then_renotify_queues_once() {
        let mut q = CascadeQueue::new();
        q.notify(StructureId(1), 0, NodeId(1));
        q.forget(StructureId(1));
        q.notify(StructureId(1), 0, NodeId(3));
        // Stale slot from the first notify is skipped, the live one is used.
        let (_, changes) = q.pop().unwrap();
        assert_eq!(changes.as_slice(), &[(0, NodeId(3))]);
        assert!(q.pop().is_none());
    }
}
