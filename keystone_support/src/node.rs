// Support nodes: one aggregation point in world space.
//
// A `SupportNode` collects every registration made at its location. Each
// registration is a `SupportKey` (structure + support point) with the value
// that point contributes: its outgoing support, or zero for a point that
// only consumes. The node's value is the strongest contribution, read off
// the root of an `IndexedMaxHeap`, or zero when nothing is registered.
//
// Nodes never call into structures. `register()` / `unregister()` return a
// `ValueChange` describing whether the aggregate actually moved, and the
// network decides who to notify by walking `keys()`. Registering a weaker
// provider under an existing maximum, or removing a non-maximal one, reports
// no change, so no cascade work is generated.
//
// A node whose last registration is removed is empty; the network then
// destroys it and evicts it from the spatial index. Nodes are never reused.
//
// See also: `heap.rs` for the indexed heap, `network.rs` for node lifetime
// and notification dispatch, `spatial.rs` for the position index.
//
// **Critical constraint: determinism.** `keys()` is returned sorted so
// notification order never depends on heap layout.

use crate::heap::IndexedMaxHeap;
use crate::types::{NodeId, SupportKey, Vec3};
use smallvec::SmallVec;

/// Old and new aggregate value after a registration change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueChange {
    pub old: f32,
    pub new: f32,
}

impl ValueChange {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

/// One support location and its registrations.
#[derive(Clone, Debug)]
pub struct SupportNode {
    id: NodeId,
    position: Vec3,
    providers: IndexedMaxHeap<SupportKey, f32>,
}

impl SupportNode {
    pub fn new(id: NodeId, position: Vec3) -> Self {
        Self {
            id,
            position,
            providers: IndexedMaxHeap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Strongest registered contribution, or zero when empty.
    pub fn current_value(&self) -> f32 {
        self.providers.peek().map_or(0.0, |(_, v)| v)
    }

    pub fn registration_count(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn is_registered(&self, key: SupportKey) -> bool {
        self.providers.contains(&key)
    }

    /// Value registered under `key`, if any.
    pub fn registered_value(&self, key: SupportKey) -> Option<f32> {
        self.providers.get(&key)
    }

    /// Register (or re-register) `key` with `value`.
    pub fn register(&mut self, key: SupportKey, value: f32) -> ValueChange {
        let old = self.current_value();
        self.providers.upsert(key, value);
        ValueChange {
            old,
            new: self.current_value(),
        }
    }

    /// Remove `key`. Returns `None` if it was not registered here.
    pub fn unregister(&mut self, key: SupportKey) -> Option<ValueChange> {
        let old = self.current_value();
        self.providers.remove(&key)?;
        Some(ValueChange {
            old,
            new: self.current_value(),
        })
    }

    /// Every registered key, sorted. This is the node's consumer list.
    pub fn keys(&self) -> SmallVec<[SupportKey; 8]> {
        let mut keys: SmallVec<[SupportKey; 8]> = self.providers.iter().map(|(k, _)| k).collect();
        keys.sort_unstable();
        keys
    }

    /// Heap consistency plus the cached-max invariant. Audit helper.
    pub(crate) fn is_consistent(&self) -> bool {
        let max = self
            .providers
            .iter()
            .map(|(_, v)| v)
            .fold(0.0f32, f32::max);
        self.providers.is_consistent() && max == self.current_value()
    }
}
