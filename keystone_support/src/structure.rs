// Placed structure instances and their support evaluation.
//
// A `Structure` is one placed piece: a `TemplateId`, a world `Transform`,
// and one `PointBinding` per template support point recording which node
// that point is registered with and whether it was satisfied the last time
// it was evaluated. The binding list is the structure's half of the
// registration map; the node's heap holds the other half, keyed by
// `SupportKey { structure, point }`. `SupportNetwork::audit()` checks the
// two agree.
//
// ## Evaluation
//
// For a required point `p` bound to node `n`:
//
//   effective   = n.value - (p.outgoing ? p.outgoing_support : 0)
//   satisfied   = effective >= p.required_support
//
// and the structure stands when at least `number_of_supports_required`
// required points are satisfied, or always when that number is zero.
// Unbound required points (node severed) are unsatisfied.
//
// ## Handlers
//
// - `on_support_changed()`: the node under one point changed value.
//   Refreshes that point's cached state and reports whether a previously
//   satisfied point just became unsatisfied. Only then does the network
//   re-run `required_supports_available()` to decide on collapse.
// - `on_support_destroyed()`: a node this structure is bound to was removed
//   from under it. Drops those bindings and reports lost support the same
//   way.
//
// Neither handler touches other structures or nodes. Acting on the result
// (unregistering, queueing neighbours) is the network's job; see the
// cascade loop in `network.rs`.
//
// See also: `template.rs` for `SupportPointSpec` and the self-exclusion
// rule, `node.rs` for node values, `cascade.rs` for the work queue.
//
// **Critical constraint: determinism.** Bindings are indexed by support
// point order, which is fixed by the template.

use crate::node::SupportNode;
use crate::template::{SupportPointSpec, StructureTemplate};
use crate::types::{NodeId, StructureId, TemplateId, Transform, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Read access to node values, so structures can evaluate themselves
/// without owning or borrowing the node table mutably.
pub trait SupportLookup {
    /// Current value of `node`, or `None` if it no longer exists.
    fn support_value(&self, node: NodeId) -> Option<f32>;
}

impl SupportLookup for BTreeMap<NodeId, SupportNode> {
    fn support_value(&self, node: NodeId) -> Option<f32> {
        self.get(&node).map(SupportNode::current_value)
    }
}

/// Lifecycle of a structure record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureState {
    /// Registered with the network and evaluated on every change.
    Standing,
    /// Collapsed under `CollapsePolicy::Debris`: unbound, never evaluated
    /// again, waiting for the collaborator to clear it.
    Debris,
}

/// One support point's link to the network.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointBinding {
    /// Node this point is registered with. `None` for inert points, before
    /// registration, and after the node was severed or the structure fell.
    pub node: Option<NodeId>,
    /// Whether the point was satisfied at its last evaluation.
    pub satisfied: bool,
}

/// A placed structure.
#[derive(Clone, Debug)]
pub struct Structure {
    id: StructureId,
    template: TemplateId,
    transform: Transform,
    is_foundation: bool,
    supports_required: u32,
    bindings: SmallVec<[PointBinding; 8]>,
    state: StructureState,
}

impl Structure {
    pub(crate) fn new(
        id: StructureId,
        template_id: TemplateId,
        template: &StructureTemplate,
        transform: Transform,
    ) -> Self {
        Self {
            id,
            template: template_id,
            transform,
            is_foundation: template.is_foundation,
            supports_required: template.number_of_supports_required,
            bindings: SmallVec::from_elem(PointBinding::default(), template.support_points.len()),
            state: StructureState::Standing,
        }
    }

    pub fn id(&self) -> StructureId {
        self.id
    }

    pub fn template(&self) -> TemplateId {
        self.template
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    pub fn is_foundation(&self) -> bool {
        self.is_foundation
    }

    pub fn supports_required(&self) -> u32 {
        self.supports_required
    }

    pub fn state(&self) -> StructureState {
        self.state
    }

    pub fn is_standing(&self) -> bool {
        self.state == StructureState::Standing
    }

    /// World position of a support point.
    pub fn world_point(&self, spec: &SupportPointSpec) -> Vec3 {
        self.transform.to_world(spec.local_position)
    }

    pub fn binding(&self, point: usize) -> Option<PointBinding> {
        self.bindings.get(point).copied()
    }

    /// `(point, node)` for every bound point, in point order.
    pub fn bound_nodes(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        self.bindings
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.node.map(|n| (i, n)))
    }

    pub(crate) fn bind(&mut self, point: usize, node: NodeId) {
        if let Some(binding) = self.bindings.get_mut(point) {
            binding.node = Some(node);
        }
    }

    /// Clear every binding and return what was bound. The caller owns
    /// unregistering these from their nodes.
    pub(crate) fn unbind_all(&mut self) -> SmallVec<[(usize, NodeId); 8]> {
        let bound = self.bound_nodes().collect();
        for binding in &mut self.bindings {
            *binding = PointBinding::default();
        }
        bound
    }

    pub(crate) fn mark_debris(&mut self) {
        self.state = StructureState::Debris;
    }

    /// Evaluate one point against current node values.
    pub fn point_satisfied(
        &self,
        point: usize,
        spec: &SupportPointSpec,
        values: &impl SupportLookup,
    ) -> bool {
        self.bindings
            .get(point)
            .and_then(|b| b.node)
            .and_then(|node| values.support_value(node))
            .is_some_and(|value| spec.is_satisfied_by(value))
    }

    /// Number of required points currently satisfied.
    pub fn supported_count(&self, template: &StructureTemplate, values: &impl SupportLookup) -> u32 {
        template
            .support_points
            .iter()
            .enumerate()
            .filter(|(i, spec)| spec.required && self.point_satisfied(*i, spec, values))
            .count() as u32
    }

    /// Whether enough required points are satisfied for the structure to
    /// stand. Always true when no supports are required.
    pub fn required_supports_available(
        &self,
        template: &StructureTemplate,
        values: &impl SupportLookup,
    ) -> bool {
        self.supports_required == 0 || self.supported_count(template, values) >= self.supports_required
    }

    /// World position of the support point nearest `world_point`.
    pub fn closest_support_point_to(
        &self,
        template: &StructureTemplate,
        world_point: Vec3,
    ) -> Option<Vec3> {
        let mut best: Option<(f32, Vec3)> = None;
        for spec in &template.support_points {
            let p = self.world_point(spec);
            let d = p.distance_squared(world_point);
            if best.is_none_or(|(bd, _)| d < bd) {
                best = Some((d, p));
            }
        }
        best.map(|(_, p)| p)
    }

    /// Recompute every point's cached state. Run once registration is done.
    pub(crate) fn refresh(&mut self, template: &StructureTemplate, values: &impl SupportLookup) {
        for (i, spec) in template.support_points.iter().enumerate() {
            let satisfied = spec.required && self.point_satisfied(i, spec, values);
            if let Some(binding) = self.bindings.get_mut(i) {
                binding.satisfied = satisfied;
            }
        }
    }

    /// The node under `point` changed value. Returns `true` when the point
    /// was satisfied before and is not any more.
    pub fn on_support_changed(
        &mut self,
        node: NodeId,
        point: usize,
        template: &StructureTemplate,
        values: &impl SupportLookup,
    ) -> bool {
        let Some(spec) = template.support_points.get(point) else {
            crate::invariant_violation!("{} has no support point {point}", self.id);
            return false;
        };
        let bound = self.bindings.get(point).and_then(|b| b.node);
        if bound != Some(node) {
            crate::invariant_violation!(
                "{} point {point} notified by {node} but bound to {bound:?}",
                self.id
            );
            return false;
        }
        if !spec.required {
            return false;
        }
        let now = self.point_satisfied(point, spec, values);
        let binding = &mut self.bindings[point];
        let was = std::mem::replace(&mut binding.satisfied, now);
        was && !now
    }

    /// `node` is gone. Drops every binding to it and returns `true` if any
    /// of them was a satisfied required point.
    pub fn on_support_destroyed(&mut self, node: NodeId) -> bool {
        let mut lost = false;
        for binding in &mut self.bindings {
            if binding.node == Some(node) {
                lost |= binding.satisfied;
                *binding = PointBinding::default();
            }
        }
        lost
    }
}
