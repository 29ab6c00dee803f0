// Indexed binary max-heap with arbitrary-key removal.
//
// A support node must drop any provider at any time, not just the current
// strongest one, so a plain `BinaryHeap` is not enough. `IndexedMaxHeap`
// keeps a parallel `key -> slot` map that is rewritten on every swap during
// sift-up / sift-down. That makes `remove(key)` O(log n): swap the victim to
// the tail, pop it, then sift the displaced element whichever way it needs
// to go.
//
// The slot map is an `FxHashMap`. It is only ever probed by key, never
// iterated, so hash order cannot leak into simulation results. Iteration
// over entries walks the backing `Vec` in slot order.
//
// See also: `node.rs`, which wraps this heap as a node's provider table.
//
// **Critical constraint: determinism.** Ties between equal values are
// resolved by slot position, which depends only on operation order.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// Max-heap keyed by `K`, ordered by `V`.
#[derive(Clone, Debug)]
pub struct IndexedMaxHeap<K, V> {
    entries: Vec<(K, V)>,
    slots: FxHashMap<K, usize>,
}

impl<K, V> Default for IndexedMaxHeap<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            slots: FxHashMap::default(),
        }
    }
}

impl<K, V> IndexedMaxHeap<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy + PartialOrd,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.slots.get(key).map(|&slot| self.entries[slot].1)
    }

    /// The maximum entry, if any.
    pub fn peek(&self) -> Option<(K, V)> {
        self.entries.first().copied()
    }

    /// Insert `key` with `value`, or move an existing key to `value`.
    /// Returns the previous value if the key was present.
    pub fn upsert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&slot) = self.slots.get(&key) {
            let old = self.entries[slot].1;
            self.entries[slot].1 = value;
            self.restore(slot);
            return Some(old);
        }
        let slot = self.entries.len();
        self.entries.push((key, value));
        self.slots.insert(key, slot);
        self.sift_up(slot);
        None
    }

    /// Remove `key` from anywhere in the heap. Returns its value, or `None`
    /// if it was not present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        let last = self.entries.len() - 1;
        if slot != last {
            self.entries.swap(slot, last);
            let moved = self.entries[slot].0;
            self.slots.insert(moved, slot);
        }
        let (_, value) = self.entries.pop()?;
        if slot < self.entries.len() {
            self.restore(slot);
        }
        Some(value)
    }

    /// Remove and return the maximum entry.
    pub fn pop(&mut self) -> Option<(K, V)> {
        let (key, _) = self.peek()?;
        self.remove(&key).map(|value| (key, value))
    }

    /// All entries in slot order (heap layout, not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.entries.iter().copied()
    }

    /// Sift the element at `slot` in whichever direction restores the heap
    /// property.
    fn restore(&mut self, slot: usize) {
        if slot > 0 && self.entries[slot].1 > self.entries[(slot - 1) / 2].1 {
            self.sift_up(slot);
        } else {
            self.sift_down(slot);
        }
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot].1 > self.entries[parent].1 {
                self.swap_slots(slot, parent);
                slot = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut largest = slot;
            if left < len && self.entries[left].1 > self.entries[largest].1 {
                largest = left;
            }
            if right < len && self.entries[right].1 > self.entries[largest].1 {
                largest = right;
            }
            if largest == slot {
                break;
            }
            self.swap_slots(slot, largest);
            slot = largest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.slots.insert(self.entries[a].0, a);
        self.slots.insert(self.entries[b].0, b);
    }

    /// Check the heap property and slot map. Test and audit helper.
    pub fn is_consistent(&self) -> bool {
        if self.slots.len() != self.entries.len() {
            return false;
        }
        for (slot, (key, value)) in self.entries.iter().enumerate() {
            if self.slots.get(key) != Some(&slot) {
                return false;
            }
            if slot > 0 && *value > self.entries[(slot - 1) / 2].1 {
                return false;
            }
        }
        true
    }
}
