// The support network: node table, spatial index, structure table, and the
// cascade loop that ties them together.
//
// `SupportNetwork` is the single owner of every `SupportNode` and every
// placed `Structure`. Nothing outside it holds references to either; the
// collaborator layer (placement preview, input, rendering) holds
// `StructureId` / `NodeId` handles and goes through the methods here. The
// network is a pure function: `(state, commands) -> (new_state, events)`.
//
// ## Placement
//
// `add_structure()` checks everything up front, so a rejected call leaves
// no partial registrations behind: the template must be registered, the
// transform finite with a unit rotation, and no required point may land on
// the same node as another point of the same structure that supplies
// support there (it would hold itself up). Then for each
// non-inert support point, in template order, it:
//   1. computes the point's world position,
//   2. reuses the closest node within `search_radius` or creates one,
//   3. registers `SupportKey { structure, point }` on that node with the
//      point's registered value (outgoing support, or zero for a pure
//      consumer),
//   4. if that moved the node's value, queues every other structure
//      registered there.
// Once every point is bound the new structure caches its per-point state
// and the queue is drained.
//
// ## Cascades
//
// Removal (`remove_structure()`, a collapse, or `sever_node()`) unregisters
// the structure's points one by one. A node that empties is destroyed and
// evicted from the index; a node whose value moved queues its remaining
// registrants. The drain loop then pops queued structures, lets each
// evaluate the points that changed under it (`Structure::on_support_changed`),
// and collapses the ones that lost a satisfied point and no longer meet
// their requirement. A collapse goes through the same unregister path, so
// the cascade spreads through the queue rather than the call stack.
//
// Because a structure is detached from every node before anything it
// touched is re-evaluated, and is dropped from the queue when it falls, no
// collection is ever mutated while it is being walked and no structure
// collapses twice.
//
// ## Invariants
//
// `audit()` re-derives every invariant the network maintains (node values
// equal the max registration, nodes and structures agree on every binding,
// nodes are pairwise farther apart than `search_radius`, template instance
// counts match) and returns a description of each violation. The test suite
// runs it after every operation.
//
// See also: `structure.rs` for per-structure evaluation, `node.rs` for node
// aggregation, `spatial.rs` for the octree, `cascade.rs` for the work queue,
// `event.rs` for emitted notifications, `command.rs` for batch input.
//
// **Critical constraint: determinism.** Node and structure tables are
// `BTreeMap`s keyed by sequential ids. The cascade is FIFO. Given the same
// config and commands, two networks produce bit-identical state and events.

use crate::cascade::{CascadeQueue, CascadeReport};
use crate::command::NetworkCommand;
use crate::config::{CollapsePolicy, NetworkConfig};
use crate::error::{Result, SupportError};
use crate::event::{NetworkEvent, NetworkEventKind};
use crate::node::SupportNode;
use crate::spatial::SupportIndex;
use crate::structure::{Structure, SupportLookup};
use crate::template::{StructureTemplate, TemplateRegistry};
use crate::types::*;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// Owner of all support nodes and structures.
#[derive(Clone, Debug)]
pub struct SupportNetwork {
    config: NetworkConfig,
    templates: TemplateRegistry,
    index: SupportIndex,
    nodes: BTreeMap<NodeId, SupportNode>,
    structures: BTreeMap<StructureId, Structure>,
    next_node_id: u64,
    next_structure_id: u64,
    /// Incremented once per external mutation.
    tick: u64,
    /// Pending notifications. Only `take_events()` and `apply()` drain this.
    events: Vec<NetworkEvent>,
}

/// Outcome of applying a batch of commands.
#[derive(Debug, Default)]
pub struct StepResult {
    /// Events emitted while applying the batch, in order.
    pub events: Vec<NetworkEvent>,
    /// Structures placed by `AddStructure` commands, in command order.
    pub placed: Vec<StructureId>,
    /// Indices of commands that were rejected and had no effect.
    pub rejected: Vec<usize>,
    /// Combined cascade report for the batch.
    pub report: CascadeReport,
}

/// Preview-only stand-in for a node that placement would reuse or create.
#[derive(Clone, Copy, Debug, PartialEq)]
enum PreviewTarget {
    Existing(NodeId),
    Planned(usize),
}

impl Default for SupportNetwork {
    fn default() -> Self {
        Self::build(NetworkConfig::default())
    }
}

impl SupportNetwork {
    /// Create an empty network with a validated config.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: NetworkConfig) -> Self {
        Self {
            index: SupportIndex::new(config.index.clone()),
            config,
            templates: TemplateRegistry::new(),
            nodes: BTreeMap::new(),
            structures: BTreeMap::new(),
            next_node_id: 0,
            next_structure_id: 0,
            tick: 0,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn register_template(&mut self, template: StructureTemplate) -> Result<TemplateId> {
        self.templates.register(template)
    }

    pub fn load_templates_json(&mut self, json: &str) -> Result<Vec<TemplateId>> {
        self.templates.load_json(json)
    }

    pub fn unregister_template(&mut self, id: TemplateId) -> Result<StructureTemplate> {
        self.templates.unregister(id)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Events emitted since the last `take_events()`.
    pub fn events(&self) -> &[NetworkEvent] {
        &self.events
    }

    /// Drain the pending events. Every mutating call appends to the buffer
    /// and nothing else clears it, so a collaborator driving the network
    /// through the direct methods (rather than `apply()`) must call this
    /// regularly, typically once per frame, or the buffer grows without
    /// bound.
    pub fn take_events(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, kind: NetworkEventKind) {
        self.events.push(NetworkEvent {
            tick: self.tick,
            kind,
        });
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// The node within `search_radius` of `position` closest to it, if any.
    pub fn try_find_node(&self, position: Vec3) -> Option<NodeId> {
        self.index.find_near(position, self.config.search_radius)
    }

    /// Placement previews probe for a snap target with this. Same lookup
    /// `add_structure()` resolves points with, so a hit here is the node a
    /// placement would share.
    pub fn try_find_support_near(&self, position: Vec3) -> Option<NodeId> {
        self.try_find_node(position)
    }

    /// Current value of a node, or `None` for an unknown/destroyed node.
    pub fn support_value(&self, node: NodeId) -> Option<f32> {
        self.nodes.support_value(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&SupportNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SupportNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Create an empty node at `position`. Fails if the position is not
    /// finite or an existing node already covers it; use `try_find_node()`
    /// first to reuse instead.
    ///
    /// An explicitly created node stays until `remove_node()` or until a
    /// registration made on it is later removed.
    pub fn create_node(&mut self, position: Vec3) -> Result<NodeId> {
        if !position.is_finite() {
            return Err(SupportError::InvalidPlacement(format!(
                "node position {position} is not finite"
            )));
        }
        if let Some(existing) = self.try_find_node(position) {
            return Err(SupportError::InvalidPlacement(format!(
                "{existing} already lies within the search radius of {position}"
            )));
        }
        self.tick += 1;
        Ok(self.insert_node(position))
    }

    /// Remove a node with no registrations.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.nodes.get(&id).ok_or(SupportError::UnknownNode(id))?;
        if !node.is_empty() {
            let registrations = node.registration_count();
            warn!(node = %id, registrations, "refusing to remove a node that is still in use");
            return Err(SupportError::NodeInUse {
                node: id,
                registrations,
            });
        }
        self.tick += 1;
        let mut report = CascadeReport::default();
        self.destroy_node(id, &mut report);
        Ok(())
    }

    fn insert_node(&mut self, position: Vec3) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.insert(id, SupportNode::new(id, position));
        self.index.insert(id, position);
        debug!(node = %id, %position, "support node created");
        self.emit(NetworkEventKind::NodeCreated {
            node_id: id,
            position,
        });
        id
    }

    fn find_or_create_node(&mut self, position: Vec3) -> NodeId {
        match self.try_find_node(position) {
            Some(id) => id,
            None => self.insert_node(position),
        }
    }

    fn destroy_node(&mut self, id: NodeId, report: &mut CascadeReport) {
        let Some(node) = self.nodes.remove(&id) else {
            crate::invariant_violation!("destroying {id}, which is not in the node table");
            return;
        };
        if !self.index.remove(id, node.position()) {
            crate::invariant_violation!("{id} was missing from the spatial index");
        }
        debug!(node = %id, "support node destroyed");
        report.nodes_destroyed.push(id);
        self.emit(NetworkEventKind::NodeDestroyed { node_id: id });
    }

    /// Destroy a node from outside (e.g. the ground under it is gone),
    /// detaching every structure bound to it and running the resulting
    /// cascade.
    pub fn sever_node(&mut self, id: NodeId) -> Result<CascadeReport> {
        let node = self.nodes.remove(&id).ok_or(SupportError::UnknownNode(id))?;
        self.tick += 1;
        if !self.index.remove(id, node.position()) {
            crate::invariant_violation!("{id} was missing from the spatial index");
        }
        debug!(node = %id, registrations = node.registration_count(), "support node severed");
        let mut report = CascadeReport::default();
        report.nodes_destroyed.push(id);
        self.emit(NetworkEventKind::NodeSevered { node_id: id });

        let mut affected: SmallVec<[StructureId; 8]> = SmallVec::new();
        for key in node.keys() {
            if affected.last() == Some(&key.structure) {
                continue;
            }
            affected.push(key.structure);
        }

        let mut lost = Vec::new();
        for structure_id in affected {
            match self.structures.get_mut(&structure_id) {
                Some(structure) if structure.is_standing() => {
                    if structure.on_support_destroyed(id) {
                        lost.push(structure_id);
                    }
                }
                _ => crate::invariant_violation!(
                    "{id} held a registration for {structure_id}, which is not standing"
                ),
            }
        }

        let mut queue = CascadeQueue::new();
        for structure_id in lost {
            self.reevaluate(structure_id, &mut queue, &mut report);
        }
        self.drain(&mut queue, &mut report);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Structures
    // -----------------------------------------------------------------------

    pub fn structure(&self, id: StructureId) -> Option<&Structure> {
        self.structures.get(&id)
    }

    /// All structure records, standing and debris, in id order.
    pub fn structures(&self) -> impl Iterator<Item = &Structure> {
        self.structures.values()
    }

    /// Number of standing structures.
    pub fn structure_count(&self) -> usize {
        self.structures.values().filter(|s| s.is_standing()).count()
    }

    /// Ids of structures left behind as debris.
    pub fn debris(&self) -> impl Iterator<Item = StructureId> + '_ {
        self.structures
            .values()
            .filter(|s| !s.is_standing())
            .map(Structure::id)
    }

    fn template_of(&self, id: TemplateId) -> Result<&StructureTemplate> {
        self.templates.get(id).ok_or(SupportError::UnknownTemplate(id))
    }

    fn standing(&self, id: StructureId) -> Result<(&Structure, &StructureTemplate)> {
        let structure = self
            .structures
            .get(&id)
            .ok_or(SupportError::UnknownStructure(id))?;
        let template = self.template_of(structure.template())?;
        Ok((structure, template))
    }

    /// Whether a placed structure currently meets its support requirement.
    /// Debris never does.
    pub fn required_supports_available(&self, id: StructureId) -> Result<bool> {
        let (structure, template) = self.standing(id)?;
        Ok(structure.is_standing() && structure.required_supports_available(template, &self.nodes))
    }

    /// World position of the structure's support point nearest
    /// `world_point`.
    pub fn closest_support_point_to(
        &self,
        id: StructureId,
        world_point: Vec3,
    ) -> Result<Option<Vec3>> {
        let (structure, template) = self.standing(id)?;
        Ok(structure.closest_support_point_to(template, world_point))
    }

    /// Place a structure and register all of its support points.
    pub fn add_structure(
        &mut self,
        template_id: TemplateId,
        position: Vec3,
        rotation: Rotation,
    ) -> Result<StructureId> {
        self.place(template_id, Transform::new(position, rotation))
            .map(|(id, _)| id)
    }

    fn place(
        &mut self,
        template_id: TemplateId,
        transform: Transform,
    ) -> Result<(StructureId, CascadeReport)> {
        let template = self.template_of(template_id)?.clone();
        let world_points = self.world_points(&template, &transform)?;
        self.resolve_targets(&template, &world_points)?;

        self.tick += 1;
        let id = StructureId(self.next_structure_id);
        self.next_structure_id += 1;
        let mut structure = Structure::new(id, template_id, &template, transform);
        let mut queue = CascadeQueue::new();

        for (point, (spec, world)) in template.support_points.iter().zip(world_points).enumerate() {
            if spec.is_inert() {
                continue;
            }
            let node_id = self.find_or_create_node(world);
            let key = SupportKey::new(id, point);
            let Some(node) = self.nodes.get_mut(&node_id) else {
                crate::invariant_violation!("resolved {node_id}, which is not in the node table");
                continue;
            };
            let change = node.register(key, spec.registered_value());
            structure.bind(point, node_id);
            if change.changed() {
                for other in node.keys() {
                    if other.structure != id {
                        queue.notify(other.structure, other.point, node_id);
                    }
                }
                trace!(node = %node_id, old = change.old, new = change.new, "node value changed");
                self.emit(NetworkEventKind::NodeValueChanged {
                    node_id,
                    old: change.old,
                    new: change.new,
                });
            }
        }

        structure.refresh(&template, &self.nodes);
        self.structures.insert(id, structure);
        self.templates.retain(template_id);
        debug!(structure = %id, template = %template_id, "structure placed");
        self.emit(NetworkEventKind::StructureAdded {
            structure_id: id,
            template_id,
        });

        let mut report = CascadeReport::default();
        self.drain(&mut queue, &mut report);
        Ok((id, report))
    }

    fn world_points(&self, template: &StructureTemplate, transform: &Transform) -> Result<Vec<Vec3>> {
        if !transform.is_finite() {
            return Err(SupportError::InvalidPlacement("transform is not finite".into()));
        }
        if !transform.rotation.is_normalized() {
            let r = transform.rotation;
            return Err(SupportError::InvalidPlacement(format!(
                "rotation ({}, {}, {}, {}) is not a unit quaternion",
                r.w, r.x, r.y, r.z
            )));
        }
        let points: Vec<Vec3> = template
            .support_points
            .iter()
            .map(|spec| transform.to_world(spec.local_position))
            .collect();
        if let Some(bad) = points.iter().find(|p| !p.is_finite()) {
            return Err(SupportError::InvalidPlacement(format!(
                "support point lands at non-finite position {bad}"
            )));
        }
        Ok(points)
    }

    /// Work out which node each non-inert point would bind to, the same way
    /// `place()` resolves them one by one: the closest of the existing nodes
    /// and the nodes earlier points would create.
    ///
    /// Rejects a placement where a required point would share its node with
    /// another point of the same structure that supplies support there; the
    /// structure would otherwise be holding itself up.
    fn resolve_targets(
        &self,
        template: &StructureTemplate,
        world_points: &[Vec3],
    ) -> Result<Vec<Option<PreviewTarget>>> {
        let radius_sq = self.config.search_radius * self.config.search_radius;
        let mut planned: Vec<Vec3> = Vec::new();
        let mut targets = Vec::with_capacity(world_points.len());

        for (spec, &world) in template.support_points.iter().zip(world_points) {
            if spec.is_inert() {
                targets.push(None);
                continue;
            }
            let existing = self.try_find_node(world).and_then(|id| {
                self.nodes
                    .get(&id)
                    .map(|n| (id, n.position().distance_squared(world)))
            });
            let planned_hit = planned
                .iter()
                .enumerate()
                .map(|(i, p)| (i, p.distance_squared(world)))
                .filter(|(_, d)| *d <= radius_sq)
                .fold(None, |best: Option<(usize, f32)>, (i, d)| match best {
                    Some((_, bd)) if bd <= d => best,
                    _ => Some((i, d)),
                });
            let target = match (existing, planned_hit) {
                (Some((id, d)), Some((_, pd))) if d <= pd => PreviewTarget::Existing(id),
                (Some((id, _)), None) => PreviewTarget::Existing(id),
                (_, Some((i, _))) => PreviewTarget::Planned(i),
                (None, None) => {
                    planned.push(world);
                    PreviewTarget::Planned(planned.len() - 1)
                }
            };
            targets.push(Some(target));
        }

        for (i, spec) in template.support_points.iter().enumerate() {
            if !spec.required {
                continue;
            }
            let shared = template
                .support_points
                .iter()
                .enumerate()
                .find(|&(j, other)| {
                    j != i && other.registered_value() > 0.0 && targets[j] == targets[i]
                });
            if let Some((j, _)) = shared {
                return Err(SupportError::InvalidPlacement(format!(
                    "'{}' point {i} would share a node with its own supporting point {j}",
                    template.name
                )));
            }
        }
        Ok(targets)
    }

    /// Dry run of `add_structure()`: would a structure placed here have its
    /// required supports? Uses the same node resolution and self-exclusion
    /// as a real placement, without touching the network, and fails on
    /// exactly the placements `add_structure()` rejects.
    pub fn can_place(
        &self,
        template_id: TemplateId,
        position: Vec3,
        rotation: Rotation,
    ) -> Result<bool> {
        let template = self.template_of(template_id)?;
        let world_points = self.world_points(template, &Transform::new(position, rotation))?;
        let targets = self.resolve_targets(template, &world_points)?;
        if template.number_of_supports_required == 0 {
            return Ok(true);
        }

        // No other point of this structure supplies support at a required
        // point's node, so after placement that point sees the existing
        // value raised to at most its own registration.
        let satisfied = template
            .support_points
            .iter()
            .zip(&targets)
            .filter(|(spec, target)| {
                let existing = match target {
                    Some(PreviewTarget::Existing(id)) => self.support_value(*id).unwrap_or(0.0),
                    Some(PreviewTarget::Planned(_)) => 0.0,
                    None => return false,
                };
                spec.is_satisfied_by(existing.max(spec.registered_value()))
            })
            .count();
        Ok(satisfied >= template.number_of_supports_required as usize)
    }

    /// Remove a structure and run the resulting cascade. Removing debris
    /// clears it.
    pub fn remove_structure(&mut self, id: StructureId) -> Result<CascadeReport> {
        let structure = self
            .structures
            .get(&id)
            .ok_or(SupportError::UnknownStructure(id))?;
        if !structure.is_standing() {
            self.clear_debris(id)?;
            return Ok(CascadeReport::default());
        }
        self.tick += 1;
        let mut queue = CascadeQueue::new();
        let mut report = CascadeReport::default();
        let Some(mut structure) = self.structures.remove(&id) else {
            return Err(SupportError::UnknownStructure(id));
        };
        let bound = structure.unbind_all();
        self.templates.release(structure.template());
        debug!(structure = %id, "structure removed");
        self.emit(NetworkEventKind::StructureRemoved { structure_id: id });
        self.unregister_points(id, &bound, &mut queue, &mut report);
        self.drain(&mut queue, &mut report);
        Ok(report)
    }

    /// Discard a debris record left by `CollapsePolicy::Debris`.
    pub fn clear_debris(&mut self, id: StructureId) -> Result<()> {
        match self.structures.get(&id) {
            Some(s) if !s.is_standing() => {}
            _ => return Err(SupportError::UnknownStructure(id)),
        }
        self.tick += 1;
        if let Some(structure) = self.structures.remove(&id) {
            self.templates.release(structure.template());
        }
        self.emit(NetworkEventKind::DebrisCleared { structure_id: id });
        Ok(())
    }

    /// Apply a batch of commands in order. Rejected commands are logged and
    /// skipped; the rest still apply.
    pub fn apply(&mut self, commands: &[NetworkCommand]) -> StepResult {
        let mut result = StepResult::default();
        for (i, command) in commands.iter().enumerate() {
            let outcome = match *command {
                NetworkCommand::AddStructure {
                    template,
                    position,
                    rotation,
                } => self
                    .place(template, Transform::new(position, rotation))
                    .map(|(id, report)| {
                        result.placed.push(id);
                        result.report.merge(report);
                    }),
                NetworkCommand::RemoveStructure { structure } => self
                    .remove_structure(structure)
                    .map(|report| result.report.merge(report)),
                NetworkCommand::SeverNode { node } => self
                    .sever_node(node)
                    .map(|report| result.report.merge(report)),
                NetworkCommand::ClearDebris { structure } => self.clear_debris(structure),
            };
            if let Err(err) = outcome {
                warn!(command = i, %err, "network command rejected");
                result.rejected.push(i);
            }
        }
        result.events = self.take_events();
        result
    }

    // -----------------------------------------------------------------------
    // Cascade
    // -----------------------------------------------------------------------

    /// Unregister `bound` points of `structure` (already detached from the
    /// table or marked debris), queueing whoever sits on nodes that changed.
    fn unregister_points(
        &mut self,
        structure: StructureId,
        bound: &[(usize, NodeId)],
        queue: &mut CascadeQueue,
        report: &mut CascadeReport,
    ) {
        for &(point, node_id) in bound {
            let key = SupportKey::new(structure, point);
            let Some(node) = self.nodes.get_mut(&node_id) else {
                crate::invariant_violation!("{key} bound to {node_id}, which does not exist");
                continue;
            };
            let Some(change) = node.unregister(key) else {
                crate::invariant_violation!("{key} bound to {node_id} but not registered there");
                continue;
            };
            if node.is_empty() {
                self.destroy_node(node_id, report);
                continue;
            }
            if !change.changed() {
                continue;
            }
            for other in node.keys() {
                if other.structure != structure {
                    queue.notify(other.structure, other.point, node_id);
                }
            }
            trace!(node = %node_id, old = change.old, new = change.new, "node value changed");
            self.emit(NetworkEventKind::NodeValueChanged {
                node_id,
                old: change.old,
                new: change.new,
            });
        }
    }

    /// Run queued evaluations until nothing is left.
    fn drain(&mut self, queue: &mut CascadeQueue, report: &mut CascadeReport) {
        while let Some((id, changes)) = queue.pop() {
            let Some(structure) = self.structures.get_mut(&id) else {
                continue;
            };
            if !structure.is_standing() {
                continue;
            }
            let Some(template) = self.templates.get(structure.template()) else {
                crate::invariant_violation!("{id} uses an unregistered template");
                continue;
            };
            report.evaluated.push(id);
            let mut lost = false;
            for (point, node) in changes {
                lost |= structure.on_support_changed(node, point, template, &self.nodes);
            }
            let falls = lost && !structure.required_supports_available(template, &self.nodes);
            if falls {
                self.collapse(id, queue, report);
            }
        }
    }

    /// Evaluate a structure that just lost a binding outright and collapse
    /// it if it can no longer stand.
    fn reevaluate(&mut self, id: StructureId, queue: &mut CascadeQueue, report: &mut CascadeReport) {
        let Ok((structure, template)) = self.standing(id) else {
            return;
        };
        if !structure.is_standing() {
            return;
        }
        report.evaluated.push(id);
        if !structure.required_supports_available(template, &self.nodes) {
            self.collapse(id, queue, report);
        }
    }

    /// Take an unsupported structure out of the network per the collapse
    /// policy, then unregister it from its nodes.
    fn collapse(&mut self, id: StructureId, queue: &mut CascadeQueue, report: &mut CascadeReport) {
        queue.forget(id);
        let policy = self.config.collapse_policy;
        let bound = match policy {
            CollapsePolicy::Delete => {
                let Some(mut structure) = self.structures.remove(&id) else {
                    return;
                };
                self.templates.release(structure.template());
                structure.unbind_all()
            }
            CollapsePolicy::Debris => {
                let Some(structure) = self.structures.get_mut(&id) else {
                    return;
                };
                structure.mark_debris();
                structure.unbind_all()
            }
        };
        debug!(structure = %id, ?policy, "structure collapsed");
        report.collapsed.push(id);
        self.emit(NetworkEventKind::StructureCollapsed {
            structure_id: id,
            policy,
        });
        self.unregister_points(id, &bound, queue, report);
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Check every invariant the network maintains. Returns one message per
    /// violation; empty means consistent.
    pub fn audit(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.index.len() != self.nodes.len() {
            problems.push(format!(
                "index holds {} entries but the node table has {}",
                self.index.len(),
                self.nodes.len()
            ));
        }

        for node in self.nodes.values() {
            let id = node.id();
            if !node.is_consistent() {
                problems.push(format!("{id} value does not match its registrations"));
            }
            if self.index.find_near(node.position(), 0.0).is_none() {
                problems.push(format!("{id} cannot be found at its own position"));
            }
            for key in node.keys() {
                let Some(structure) = self.structures.get(&key.structure) else {
                    problems.push(format!("{id} registers {key} for a missing structure"));
                    continue;
                };
                if structure.binding(key.point).and_then(|b| b.node) != Some(id) {
                    problems.push(format!("{id} registers {key} but the structure is not bound to it"));
                }
                let expected = self
                    .templates
                    .get(structure.template())
                    .and_then(|t| t.support_points.get(key.point))
                    .map(|spec| spec.registered_value());
                if expected != node.registered_value(key) {
                    problems.push(format!("{id} holds the wrong value for {key}"));
                }
            }
        }

        let radius_sq = self.config.search_radius * self.config.search_radius;
        let positions: Vec<(NodeId, Vec3)> =
            self.nodes.values().map(|n| (n.id(), n.position())).collect();
        for (i, &(a, pa)) in positions.iter().enumerate() {
            for &(b, pb) in &positions[i + 1..] {
                if pa.distance_squared(pb) <= radius_sq {
                    problems.push(format!("{a} and {b} are within the search radius"));
                }
            }
        }

        let mut instances: BTreeMap<TemplateId, u32> = BTreeMap::new();
        for structure in self.structures.values() {
            let id = structure.id();
            *instances.entry(structure.template()).or_default() += 1;
            let Some(template) = self.templates.get(structure.template()) else {
                problems.push(format!("{id} uses an unregistered template"));
                continue;
            };
            if !structure.is_standing() {
                if structure.bound_nodes().next().is_some() {
                    problems.push(format!("debris {id} is still bound"));
                }
                continue;
            }
            for (point, node_id) in structure.bound_nodes() {
                let key = SupportKey::new(id, point);
                if !self.nodes.get(&node_id).is_some_and(|n| n.is_registered(key)) {
                    problems.push(format!("{key} is bound to {node_id} but not registered there"));
                }
            }
            for (point, spec) in template.support_points.iter().enumerate() {
                let cached = structure.binding(point).is_some_and(|b| b.satisfied);
                let actual = spec.required && structure.point_satisfied(point, spec, &self.nodes);
                if cached != actual {
                    problems.push(format!("{id} point {point} has a stale satisfied flag"));
                }
            }
        }
        for (&template, &count) in &instances {
            if self.templates.instance_count(template) != count {
                problems.push(format!(
                    "{template} counts {} instances, {count} found",
                    self.templates.instance_count(template)
                ));
            }
        }

        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::SupportPointSpec;

    fn network() -> SupportNetwork {
        SupportNetwork::new(NetworkConfig::default()).unwrap()
    }

    fn assert_consistent(net: &SupportNetwork) {
        let problems = net.audit();
        assert!(problems.is_empty(), "audit failed: {problems:#?}");
    }

    #[test]
    fn foundation_creates_nodes_at_corners() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::foundation()).unwrap();
        let id = net.add_structure(t, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        assert_eq!(net.node_count(), 4);
        assert!(net.required_supports_available(id).unwrap());
        let node = net.try_find_node(Vec3::new(1.0, 1.0, 1.0)).unwrap();
        assert_eq!(net.support_value(node), Some(1.0));
        assert_consistent(&net);
    }

    #[test]
    fn pillar_on_foundation_shares_a_node() {
        let mut net = network();
        let f = net.register_template(StructureTemplate::foundation()).unwrap();
        let p = net.register_template(StructureTemplate::pillar()).unwrap();
        net.add_structure(f, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        let pillar = net
            .add_structure(p, Vec3::new(1.0, 1.0, 1.0), Rotation::IDENTITY)
            .unwrap();
        // Base reuses the corner node, top adds one.
        assert_eq!(net.node_count(), 5);
        assert!(net.required_supports_available(pillar).unwrap());
        assert_consistent(&net);
    }

    #[test]
    fn unknown_template_is_rejected_without_side_effects() {
        let mut net = network();
        let err = net
            .add_structure(TemplateId(42), Vec3::ZERO, Rotation::IDENTITY)
            .unwrap_err();
        assert!(matches!(err, SupportError::UnknownTemplate(_)));
        assert_eq!(net.node_count(), 0);
        assert!(net.events().is_empty());
    }

    #[test]
    fn non_finite_placement_is_rejected() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::pillar()).unwrap();
        let err = net
            .add_structure(t, Vec3::new(f32::NAN, 0.0, 0.0), Rotation::IDENTITY)
            .unwrap_err();
        assert!(matches!(err, SupportError::InvalidPlacement(_)));
        assert_eq!(net.node_count(), 0);
        assert_eq!(net.templates().instance_count(t), 0);
    }

    #[test]
    fn take_events_drains_the_buffer() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::pillar()).unwrap();
        let id = net.add_structure(t, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        net.remove_structure(id).unwrap();
        let first = net.take_events();
        assert!(first.iter().any(|e| e.kind.is_structure_destruction()));
        assert!(net.events().is_empty());
        assert!(net.take_events().is_empty());
    }

    #[test]
    fn non_unit_rotation_is_rejected() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::beam()).unwrap();
        let scaled: Rotation = serde_json::from_str(r#"{"w":0,"x":0,"y":3,"z":0}"#).unwrap();
        assert!(matches!(
            net.can_place(t, Vec3::ZERO, scaled),
            Err(SupportError::InvalidPlacement(_))
        ));
        assert!(matches!(
            net.add_structure(t, Vec3::ZERO, scaled),
            Err(SupportError::InvalidPlacement(_))
        ));
        let zero = Rotation {
            w: 0.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        };
        assert!(net.add_structure(t, Vec3::ZERO, zero).is_err());
        assert_eq!(net.node_count(), 0);
        assert_eq!(net.templates().instance_count(t), 0);
        assert!(net.events().is_empty());
    }

    #[test]
    fn structure_cannot_rest_on_its_own_support() {
        let mut net = network();
        let t = net
            .register_template(StructureTemplate {
                name: "self_propped".into(),
                is_foundation: false,
                number_of_supports_required: 1,
                support_points: vec![
                    SupportPointSpec::requires(Vec3::ZERO, 0.5),
                    SupportPointSpec::provides(Vec3::new(0.05, 0.0, 0.0), 1.0),
                ],
            })
            .unwrap();
        let at = Vec3::new(50.0, 50.0, 50.0);
        assert!(matches!(
            net.can_place(t, at, Rotation::IDENTITY),
            Err(SupportError::InvalidPlacement(_))
        ));
        assert!(matches!(
            net.add_structure(t, at, Rotation::IDENTITY),
            Err(SupportError::InvalidPlacement(_))
        ));
        assert_eq!(net.node_count(), 0);
        assert_eq!(net.structure_count(), 0);

        // Apart from each other the same points are an ordinary pillar.
        let pillar = net.register_template(StructureTemplate::pillar()).unwrap();
        let id = net.add_structure(pillar, at, Rotation::IDENTITY).unwrap();
        assert!(!net.required_supports_available(id).unwrap());
        assert_consistent(&net);
    }

    #[test]
    fn consumer_points_may_share_a_node() {
        let mut net = network();
        let f = net.register_template(StructureTemplate::foundation()).unwrap();
        let t = net
            .register_template(StructureTemplate {
                name: "two_feet".into(),
                is_foundation: false,
                number_of_supports_required: 1,
                support_points: vec![
                    SupportPointSpec::requires(Vec3::ZERO, 0.5),
                    SupportPointSpec::requires(Vec3::new(0.05, 0.0, 0.0), 0.5),
                ],
            })
            .unwrap();
        net.add_structure(f, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        let corner = Vec3::new(1.0, 1.0, 1.0);
        assert!(net.can_place(t, corner, Rotation::IDENTITY).unwrap());
        let id = net.add_structure(t, corner, Rotation::IDENTITY).unwrap();
        assert!(net.required_supports_available(id).unwrap());
        assert_consistent(&net);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "but not registered there")]
    fn desynced_binding_trips_the_invariant_check() {
        let mut net = network();
        let node = net.create_node(Vec3::ZERO).unwrap();
        let mut queue = CascadeQueue::new();
        let mut report = CascadeReport::default();
        // A binding the node never registered.
        net.unregister_points(StructureId(7), &[(0, node)], &mut queue, &mut report);
    }

    #[test]
    fn remove_node_in_use_is_a_contract_violation() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::pillar()).unwrap();
        net.add_structure(t, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        let node = net.try_find_node(Vec3::ZERO).unwrap();
        assert!(matches!(
            net.remove_node(node),
            Err(SupportError::NodeInUse { registrations: 1, .. })
        ));
        assert_consistent(&net);
    }

    #[test]
    fn create_and_remove_empty_node() {
        let mut net = network();
        let id = net.create_node(Vec3::new(3.0, 0.0, 0.0)).unwrap();
        assert_eq!(net.try_find_node(Vec3::new(3.05, 0.0, 0.0)), Some(id));
        assert!(net.create_node(Vec3::new(3.01, 0.0, 0.0)).is_err());
        net.remove_node(id).unwrap();
        assert_eq!(net.try_find_node(Vec3::new(3.0, 0.0, 0.0)), None);
        assert!(matches!(net.remove_node(id), Err(SupportError::UnknownNode(_))));
    }

    #[test]
    fn closest_support_point_follows_rotation() {
        let mut net = network();
        let t = net.register_template(StructureTemplate::beam()).unwrap();
        let id = net
            .add_structure(
                t,
                Vec3::new(0.0, 5.0, 0.0),
                Rotation::from_yaw(std::f32::consts::FRAC_PI_2),
            )
            .unwrap();
        // Yawed a quarter turn, the beam's +X end points toward -Z.
        let p = net
            .closest_support_point_to(id, Vec3::new(0.0, 5.0, -10.0))
            .unwrap()
            .unwrap();
        assert!(p.distance(Vec3::new(0.0, 5.0, -1.0)) < 1e-5);
    }

    #[test]
    fn removing_debris_clears_it() {
        let mut net = SupportNetwork::new(NetworkConfig {
            collapse_policy: CollapsePolicy::Debris,
            ..NetworkConfig::default()
        })
        .unwrap();
        let f = net.register_template(StructureTemplate::foundation()).unwrap();
        let p = net.register_template(StructureTemplate::pillar()).unwrap();
        let base = net.add_structure(f, Vec3::ZERO, Rotation::IDENTITY).unwrap();
        let pillar = net
            .add_structure(p, Vec3::new(1.0, 1.0, 1.0), Rotation::IDENTITY)
            .unwrap();
        net.remove_structure(base).unwrap();
        assert_eq!(net.debris().collect::<Vec<_>>(), vec![pillar]);
        assert!(!net.required_supports_available(pillar).unwrap());
        assert_consistent(&net);

        net.remove_structure(pillar).unwrap();
        assert_eq!(net.debris().count(), 0);
        assert_eq!(net.templates().instance_count(p), 0);
        assert_consistent(&net);
    }
}
