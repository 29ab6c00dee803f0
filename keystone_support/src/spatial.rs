// Octree spatial index over support node positions.
//
// The index answers one question quickly: "is there already a support node
// within `radius` of this point, and if so which one is closest?" That is
// what lets two structures placed edge to edge share one node instead of
// each creating their own.
//
// ## Layout
//
// Each `Octant` is an axis-aligned cube (`center`, `half`). Leaves hold up
// to `leaf_capacity` `(NodeId, Vec3)` entries; past that a leaf splits into
// eight children, unless it is already at `max_depth`, in which case it just
// grows. Child index bits are `x | y << 1 | z << 2`, set when the point is
// `>=` the parent center on that axis, so a given position always descends
// to the same leaf. Removal relies on this: it walks the stored position
// down instead of searching.
//
// After a removal, a branch whose subtree holds `leaf_capacity` entries or
// fewer collapses back into a single leaf.
//
// Positions outside the root cube grow the root: the half extent doubles
// (keeping the center) until the point fits, then every entry is
// reinserted. Growth is rare and amortized.
//
// ## Queries
//
// `find_near()` descends only into octants whose cube lies within `radius`
// of the query point and keeps the candidate with the smallest squared
// distance. On exact ties the first one found wins (octants are visited in
// index order, entries in insertion order).
//
// See also: `network.rs`, which owns the index alongside the node table and
// keeps the two in sync. `config.rs` for `IndexConfig`.
//
// **Critical constraint: determinism.** Traversal order is fixed by child
// index and per-leaf insertion order. No hashing.

use crate::config::IndexConfig;
use crate::types::{NodeId, Vec3};

/// One indexed node position.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Entry {
    id: NodeId,
    position: Vec3,
}

#[derive(Clone, Debug)]
enum Contents {
    Leaf(Vec<Entry>),
    Branch(Box<[Octant; 8]>),
}

#[derive(Clone, Debug)]
struct Octant {
    center: Vec3,
    half: f32,
    /// Entries in this subtree.
    count: usize,
    contents: Contents,
}

impl Octant {
    fn leaf(center: Vec3, half: f32) -> Self {
        Self {
            center,
            half,
            count: 0,
            contents: Contents::Leaf(Vec::new()),
        }
    }

    fn child_index(&self, p: Vec3) -> usize {
        let mut idx = 0;
        if p.x >= self.center.x {
            idx |= 1;
        }
        if p.y >= self.center.y {
            idx |= 2;
        }
        if p.z >= self.center.z {
            idx |= 4;
        }
        idx
    }

    fn child_center(&self, idx: usize) -> Vec3 {
        let q = self.half * 0.5;
        let pick = |bit: usize| if idx & bit != 0 { q } else { -q };
        self.center + Vec3::new(pick(1), pick(2), pick(4))
    }

    fn contains(&self, p: Vec3) -> bool {
        let d = p - self.center;
        d.x.abs() <= self.half && d.y.abs() <= self.half && d.z.abs() <= self.half
    }

    /// Squared distance from `p` to the nearest point of this cube.
    fn distance_squared_to(&self, p: Vec3) -> f32 {
        let h = Vec3::new(self.half, self.half, self.half);
        let nearest = p.clamp(self.center - h, self.center + h);
        p.distance_squared(nearest)
    }

    fn insert(&mut self, entry: Entry, depth: u32, cfg: &IndexConfig) {
        self.count += 1;
        let idx = self.child_index(entry.position);
        let overfull = match &mut self.contents {
            Contents::Branch(children) => {
                children[idx].insert(entry, depth + 1, cfg);
                false
            }
            Contents::Leaf(entries) => {
                entries.push(entry);
                entries.len() > cfg.leaf_capacity
            }
        };
        if overfull && depth < cfg.max_depth {
            self.split(depth, cfg);
        }
    }

    fn split(&mut self, depth: u32, cfg: &IndexConfig) {
        let entries = match std::mem::replace(&mut self.contents, Contents::Leaf(Vec::new())) {
            Contents::Leaf(entries) => entries,
            branch @ Contents::Branch(_) => {
                self.contents = branch;
                return;
            }
        };
        let children: [Octant; 8] =
            std::array::from_fn(|i| Octant::leaf(self.child_center(i), self.half * 0.5));
        let mut children = Box::new(children);
        for entry in entries {
            let idx = self.child_index(entry.position);
            children[idx].insert(entry, depth + 1, cfg);
        }
        self.contents = Contents::Branch(children);
    }

    fn remove(&mut self, id: NodeId, position: Vec3, cfg: &IndexConfig) -> bool {
        let idx = self.child_index(position);
        let removed = match &mut self.contents {
            Contents::Leaf(entries) => match entries.iter().position(|e| e.id == id) {
                Some(i) => {
                    // Preserve insertion order for tie-breaking.
                    entries.remove(i);
                    true
                }
                None => false,
            },
            Contents::Branch(children) => children[idx].remove(id, position, cfg),
        };
        if removed {
            self.count -= 1;
            if matches!(self.contents, Contents::Branch(_)) && self.count <= cfg.leaf_capacity {
                self.collapse();
            }
        }
        removed
    }

    fn collapse(&mut self) {
        let count = self.count;
        let mut entries = Vec::with_capacity(count);
        self.drain_into(&mut entries);
        self.contents = Contents::Leaf(entries);
        self.count = count;
    }

    fn drain_into(&mut self, out: &mut Vec<Entry>) {
        match std::mem::replace(&mut self.contents, Contents::Leaf(Vec::new())) {
            Contents::Leaf(entries) => out.extend(entries),
            Contents::Branch(mut children) => {
                for child in children.iter_mut() {
                    child.drain_into(out);
                }
            }
        }
        self.count = 0;
    }

    fn find_near(&self, p: Vec3, radius_sq: f32, best: &mut Option<(f32, NodeId)>) {
        if self.count == 0 || self.distance_squared_to(p) > radius_sq {
            return;
        }
        // A closer candidate already rules this cube out.
        if matches!(*best, Some((best_d, _)) if self.distance_squared_to(p) >= best_d) {
            return;
        }
        match &self.contents {
            Contents::Leaf(entries) => {
                for e in entries {
                    let d = p.distance_squared(e.position);
                    if d > radius_sq {
                        continue;
                    }
                    let closer = match *best {
                        Some((best_d, _)) => d < best_d,
                        None => true,
                    };
                    if closer {
                        *best = Some((d, e.id));
                    }
                }
            }
            Contents::Branch(children) => {
                for child in children.iter() {
                    child.find_near(p, radius_sq, best);
                }
            }
        }
    }

    fn depth(&self) -> u32 {
        match &self.contents {
            Contents::Leaf(_) => 0,
            Contents::Branch(children) => 1 + children.iter().map(Octant::depth).max().unwrap_or(0),
        }
    }
}

/// Spatial index of support node positions.
#[derive(Clone, Debug)]
pub struct SupportIndex {
    root: Octant,
    config: IndexConfig,
}

impl SupportIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            root: Octant::leaf(config.center, config.half_extent),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.root.count
    }

    pub fn is_empty(&self) -> bool {
        self.root.count == 0
    }

    /// Current root half extent (grows when positions land outside it).
    pub fn half_extent(&self) -> f32 {
        self.root.half
    }

    /// Number of branch levels below the root.
    pub fn depth(&self) -> u32 {
        self.root.depth()
    }

    /// Add a node at `position`. The caller guarantees `id` is not already
    /// indexed.
    pub fn insert(&mut self, id: NodeId, position: Vec3) {
        if !self.root.contains(position) {
            self.grow_to_fit(position);
        }
        self.root.insert(Entry { id, position }, 0, &self.config);
    }

    /// Remove a node previously inserted at `position`. Returns whether it
    /// was found.
    pub fn remove(&mut self, id: NodeId, position: Vec3) -> bool {
        self.root.remove(id, position, &self.config)
    }

    /// The node closest to `position` among those within `radius`, or
    /// `None` if nothing is that close.
    pub fn find_near(&self, position: Vec3, radius: f32) -> Option<NodeId> {
        let mut best = None;
        self.root.find_near(position, radius * radius, &mut best);
        best.map(|(_, id)| id)
    }

    fn grow_to_fit(&mut self, position: Vec3) {
        let mut half = self.root.half;
        let d = position - self.root.center;
        let reach = d.x.abs().max(d.y.abs()).max(d.z.abs());
        while half < reach {
            half *= 2.0;
        }
        tracing::debug!(
            from = self.root.half,
            to = half,
            "growing support index root to fit {position}"
        );
        let mut entries = Vec::with_capacity(self.root.count);
        self.root.drain_into(&mut entries);
        self.root = Octant::leaf(self.root.center, half);
        for entry in entries {
            self.root.insert(entry, 0, &self.config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn small_config() -> IndexConfig {
        IndexConfig {
            center: Vec3::ZERO,
            half_extent: 16.0,
            leaf_capacity: 2,
            max_depth: 6,
        }
    }

    #[test]
    fn empty_index_finds_nothing() {
        let index = SupportIndex::new(small_config());
        assert_eq!(index.find_near(Vec3::ZERO, 100.0), None);
    }

    #[test]
    fn nearby_queries_reuse_same_node() {
        let mut index = SupportIndex::new(small_config());
        index.insert(NodeId(1), Vec3::new(1.0, 0.0, 1.0));
        let a = index.find_near(Vec3::new(1.05, 0.0, 1.0), 0.1);
        let b = index.find_near(Vec3::new(0.95, 0.02, 1.0), 0.1);
        assert_eq!(a, Some(NodeId(1)));
        assert_eq!(a, b);
        assert_eq!(index.find_near(Vec3::new(1.5, 0.0, 1.0), 0.1), None);
    }

    #[test]
    fn closest_candidate_wins() {
        let mut index = SupportIndex::new(small_config());
        index.insert(NodeId(1), Vec3::new(0.0, 0.0, 0.0));
        index.insert(NodeId(2), Vec3::new(0.4, 0.0, 0.0));
        index.insert(NodeId(3), Vec3::new(-0.3, 0.0, 0.0));
        assert_eq!(index.find_near(Vec3::new(0.3, 0.0, 0.0), 1.0), Some(NodeId(2)));
        assert_eq!(index.find_near(Vec3::new(-0.2, 0.0, 0.0), 1.0), Some(NodeId(3)));
    }

    #[test]
    fn split_and_collapse() {
        let mut index = SupportIndex::new(small_config());
        for i in 0..10 {
            index.insert(NodeId(i), Vec3::new(i as f32, 0.5, 0.5));
        }
        assert!(index.depth() > 0);
        for i in 0..9 {
            assert!(index.remove(NodeId(i), Vec3::new(i as f32, 0.5, 0.5)));
        }
        assert_eq!(index.len(), 1);
        assert_eq!(index.depth(), 0);
        assert_eq!(index.find_near(Vec3::new(9.0, 0.5, 0.5), 0.1), Some(NodeId(9)));
    }

    #[test]
    fn removed_node_is_not_returned() {
        let mut index = SupportIndex::new(small_config());
        let p = Vec3::new(2.0, 3.0, 4.0);
        index.insert(NodeId(5), p);
        assert!(index.remove(NodeId(5), p));
        assert!(!index.remove(NodeId(5), p));
        assert_eq!(index.find_near(p, 1.0), None);
        assert!(index.is_empty());
    }

    #[test]
    fn root_grows_for_far_positions() {
        let mut index = SupportIndex::new(small_config());
        index.insert(NodeId(1), Vec3::new(1.0, 1.0, 1.0));
        let far = Vec3::new(100.0, -40.0, 3.0);
        index.insert(NodeId(2), far);
        assert!(index.half_extent() >= 100.0);
        assert_eq!(index.find_near(far, 0.5), Some(NodeId(2)));
        assert_eq!(index.find_near(Vec3::new(1.0, 1.0, 1.0), 0.5), Some(NodeId(1)));
    }

    #[test]
    fn depth_limit_keeps_coincident_points() {
        let mut index = SupportIndex::new(IndexConfig {
            max_depth: 2,
            ..small_config()
        });
        for i in 0..20 {
            index.insert(NodeId(i), Vec3::new(3.0, 3.0, 3.0));
        }
        assert!(index.depth() <= 2);
        assert_eq!(index.len(), 20);
        // First inserted wins the exact tie.
        assert_eq!(index.find_near(Vec3::new(3.0, 3.0, 3.0), 0.1), Some(NodeId(0)));
    }

    proptest! {
        #[test]
        fn find_near_matches_linear_scan(
            points in proptest::collection::vec((-30i32..30, -30i32..30, -30i32..30), 1..60),
            removals in proptest::collection::vec(any::<proptest::sample::Index>(), 0..20),
            queries in proptest::collection::vec((-35i32..35, -35i32..35, -35i32..35), 1..20),
        ) {
            let mut index = SupportIndex::new(small_config());
            let mut live: Vec<(NodeId, Vec3)> = Vec::new();
            for (i, (x, y, z)) in points.iter().enumerate() {
                let p = Vec3::new(*x as f32 * 0.5, *y as f32 * 0.5, *z as f32 * 0.5);
                index.insert(NodeId(i as u64), p);
                live.push((NodeId(i as u64), p));
            }
            for r in removals {
                if live.is_empty() {
                    break;
                }
                let (id, p) = live.remove(r.index(live.len()));
                prop_assert!(index.remove(id, p));
            }
            prop_assert_eq!(index.len(), live.len());
            for (x, y, z) in queries {
                let q = Vec3::new(x as f32 * 0.5, y as f32 * 0.5, z as f32 * 0.5);
                let radius = 3.0f32;
                let found = index.find_near(q, radius);
                let best_d = live
                    .iter()
                    .map(|(_, p)| q.distance_squared(*p))
                    .filter(|d| *d <= radius * radius)
                    .fold(None, |acc: Option<f32>, d| Some(acc.map_or(d, |a| a.min(d))));
                match (found, best_d) {
                    (None, None) => {}
                    (Some(id), Some(d)) => {
                        let p = live.iter().find(|(l, _)| *l == id).map(|(_, p)| *p);
                        prop_assert_eq!(p.map(|p| q.distance_squared(p)), Some(d));
                    }
                    (found, expected) => {
                        prop_assert!(false, "index returned {:?}, scan found {:?}", found, expected);
                    }
                }
            }
        }
    }
}
