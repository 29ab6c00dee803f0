// Structure templates and their support point specs.
//
// A `StructureTemplate` is the immutable definition of one kind of placeable
// piece: its support points in local space, whether it is a foundation, and
// how many of its required points must be satisfied for it to stand. Many
// placed `Structure`s share one template. They hold a `TemplateId`, never a
// reference, and look the template up in the `TemplateRegistry` when they
// need it.
//
// ## Support points
//
// Each `SupportPointSpec` can:
// - require incoming support (`required` + `required_support`),
// - supply outgoing support (`outgoing` + `outgoing_support`),
// - do both (a pillar passing support upward through itself),
// - or neither, in which case it is inert and never registers with a node.
//
// ## Registry
//
// Templates are interned by name: registering an identical template twice
// returns the same id, registering a different template under a taken name
// is an error. The registry counts live instances per template so a
// template cannot be unregistered while structures still use it.
//
// Named preset constructors (`foundation()`, `pillar()`, `beam()`,
// `floor_panel()`) cover the common building pieces and are what the tests
// and benches build with.
//
// See also: `structure.rs` for the per-instance state that pairs with a
// template, `network.rs` which owns the `TemplateRegistry`.
//
// **Critical constraint: determinism.** Registry storage is `BTreeMap` and
// ids are sequential.

use crate::error::{Result, SupportError};
use crate::types::{TemplateId, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One local attachment point of a structure template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupportPointSpec {
    /// Position relative to the structure's origin, before rotation.
    pub local_position: Vec3,
    /// Whether this point needs incoming support.
    #[serde(default)]
    pub required: bool,
    /// Minimum effective node value for this point to count as satisfied.
    #[serde(default)]
    pub required_support: f32,
    /// Whether this point supplies support to its node.
    #[serde(default)]
    pub outgoing: bool,
    /// Value this point contributes to its node.
    #[serde(default)]
    pub outgoing_support: f32,
}

impl SupportPointSpec {
    /// A point that only needs support.
    pub fn requires(local_position: Vec3, required_support: f32) -> Self {
        Self {
            local_position,
            required: true,
            required_support,
            outgoing: false,
            outgoing_support: 0.0,
        }
    }

    /// A point that only supplies support.
    pub fn provides(local_position: Vec3, outgoing_support: f32) -> Self {
        Self {
            local_position,
            required: false,
            required_support: 0.0,
            outgoing: true,
            outgoing_support,
        }
    }

    /// A point that both needs and supplies support at the same location.
    pub fn passes(local_position: Vec3, required_support: f32, outgoing_support: f32) -> Self {
        Self {
            local_position,
            required: true,
            required_support,
            outgoing: true,
            outgoing_support,
        }
    }

    /// Inert points neither need nor supply support and never bind a node.
    pub fn is_inert(&self) -> bool {
        !self.required && !self.outgoing
    }

    /// The value this point registers on its node: its outgoing support if
    /// it provides any, otherwise zero (it still registers as a consumer).
    pub fn registered_value(&self) -> f32 {
        if self.outgoing { self.outgoing_support } else { 0.0 }
    }

    /// The value of `node_value` left once this point's own contribution is
    /// taken out. Support cannot be self-provided.
    ///
    /// This subtracts from the node's maximum unconditionally, which is only
    /// exact when this point is the node's strongest provider.
    pub fn effective_value(&self, node_value: f32) -> f32 {
        node_value - self.registered_value()
    }

    /// Whether a node reporting `node_value` satisfies this point.
    pub fn is_satisfied_by(&self, node_value: f32) -> bool {
        self.required && self.effective_value(node_value) >= self.required_support
    }
}

/// Immutable definition of a placeable structure type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructureTemplate {
    /// Unique registry name.
    pub name: String,
    /// Foundations are anchored to the ground by the placement layer.
    #[serde(default)]
    pub is_foundation: bool,
    /// Satisfied required points needed to stand. Zero means always
    /// supported.
    #[serde(default)]
    pub number_of_supports_required: u32,
    /// Ordered support points. A structure's bindings use the same indices.
    pub support_points: Vec<SupportPointSpec>,
}

impl StructureTemplate {
    /// Ground slab: 2x2 footprint, supplies full support at its four top
    /// corners, needs nothing.
    pub fn foundation() -> Self {
        let corners = [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)];
        Self {
            name: "foundation".into(),
            is_foundation: true,
            number_of_supports_required: 0,
            support_points: corners
                .iter()
                .map(|&(x, z)| SupportPointSpec::provides(Vec3::new(x, 1.0, z), 1.0))
                .collect(),
        }
    }

    /// Vertical post, two units tall: needs support at its base and carries
    /// it to its top.
    pub fn pillar() -> Self {
        Self {
            name: "pillar".into(),
            is_foundation: false,
            number_of_supports_required: 1,
            support_points: vec![
                SupportPointSpec::requires(Vec3::ZERO, 0.5),
                SupportPointSpec::provides(Vec3::new(0.0, 2.0, 0.0), 1.0),
            ],
        }
    }

    /// Horizontal beam along X, two units long. Either end can hold it up,
    /// and both ends pass half support on.
    pub fn beam() -> Self {
        Self {
            name: "beam".into(),
            is_foundation: false,
            number_of_supports_required: 1,
            support_points: vec![
                SupportPointSpec::passes(Vec3::new(-1.0, 0.0, 0.0), 0.5, 0.5),
                SupportPointSpec::passes(Vec3::new(1.0, 0.0, 0.0), 0.5, 0.5),
            ],
        }
    }

    /// 2x2 floor panel resting on its corners. Needs two supported corners.
    pub fn floor_panel() -> Self {
        let corners = [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)];
        Self {
            name: "floor_panel".into(),
            is_foundation: false,
            number_of_supports_required: 2,
            support_points: corners
                .iter()
                .map(|&(x, z)| SupportPointSpec::passes(Vec3::new(x, 0.0, z), 0.5, 0.25))
                .collect(),
        }
    }

    /// Number of points marked `required`.
    pub fn required_point_count(&self) -> usize {
        self.support_points.iter().filter(|p| p.required).count()
    }

    /// Check ranges and satisfiability. Called by the registry before a
    /// template is accepted, so nothing downstream re-checks.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| SupportError::InvalidTemplate {
            name: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.support_points.is_empty() {
            return Err(invalid("template has no support points".into()));
        }
        for (i, point) in self.support_points.iter().enumerate() {
            if !point.local_position.is_finite() {
                return Err(invalid(format!("support point {i} has a non-finite position")));
            }
            for (label, value) in [
                ("required_support", point.required_support),
                ("outgoing_support", point.outgoing_support),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(invalid(format!(
                        "support point {i}: {label} {value} is outside [0, 1]"
                    )));
                }
            }
        }
        let required = self.required_point_count();
        if self.number_of_supports_required as usize > required {
            return Err(invalid(format!(
                "needs {} supports but only has {required} required point(s)",
                self.number_of_supports_required
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct RegisteredTemplate {
    template: StructureTemplate,
    /// Structures (live or debris) still holding this id.
    instances: u32,
}

/// Interned, instance-counted template storage.
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    entries: BTreeMap<TemplateId, RegisteredTemplate>,
    by_name: BTreeMap<String, TemplateId>,
    next_id: u64,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and intern a template. An identical template already
    /// registered under the same name yields its existing id.
    pub fn register(&mut self, template: StructureTemplate) -> Result<TemplateId> {
        template.validate()?;
        if let Some(&id) = self.by_name.get(&template.name) {
            return match self.entries.get(&id) {
                Some(existing) if existing.template == template => Ok(id),
                _ => Err(SupportError::DuplicateTemplate(template.name)),
            };
        }
        let id = TemplateId(self.next_id);
        self.next_id += 1;
        self.by_name.insert(template.name.clone(), id);
        self.entries.insert(
            id,
            RegisteredTemplate {
                template,
                instances: 0,
            },
        );
        Ok(id)
    }

    /// Register every template in a JSON array, in order. Stops at the first
    /// invalid template; templates before it stay registered.
    pub fn load_json(&mut self, json: &str) -> Result<Vec<TemplateId>> {
        let templates: Vec<StructureTemplate> = serde_json::from_str(json)?;
        templates.into_iter().map(|t| self.register(t)).collect()
    }

    /// Remove a template nothing references any more.
    pub fn unregister(&mut self, id: TemplateId) -> Result<StructureTemplate> {
        let entry = self.entries.get(&id).ok_or(SupportError::UnknownTemplate(id))?;
        if entry.instances > 0 {
            return Err(SupportError::TemplateInUse {
                template: id,
                instances: entry.instances,
            });
        }
        let entry = self.entries.remove(&id).ok_or(SupportError::UnknownTemplate(id))?;
        self.by_name.remove(&entry.template.name);
        Ok(entry.template)
    }

    pub fn get(&self, id: TemplateId) -> Option<&StructureTemplate> {
        self.entries.get(&id).map(|e| &e.template)
    }

    pub fn id_of(&self, name: &str) -> Option<TemplateId> {
        self.by_name.get(name).copied()
    }

    pub fn instance_count(&self, id: TemplateId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.instances)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn retain(&mut self, id: TemplateId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.instances += 1;
        }
    }

    pub(crate) fn release(&mut self, id: TemplateId) {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.instances > 0 => entry.instances -= 1,
            _ => crate::invariant_violation!("released {id} with no outstanding instances"),
        }
    }
}
