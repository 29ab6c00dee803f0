// keystone_support — structural support network for building placement.
//
// Placed structures (foundations, pillars, beams, floor panels) declare
// support points: locations where they need support from below and/or
// offer support to whatever sits on them. Points that land within a small
// radius of each other share a support node. A node's value is the
// strongest support any of its registrants offers, and a structure stands
// while enough of its required points see at least their required support
// once their own contribution is excluded. Removing a structure can drop
// node values under its neighbours, which can bring them down in turn; the
// network runs that cascade to completion inside each mutating call.
//
// Module overview:
// - `network.rs`:   SupportNetwork: placement, removal, severing, the cascade
//                   drain loop, `can_place` preview, and `audit`.
// - `structure.rs`: Placed structure instances, per-point bindings, support
//                   evaluation and change handlers.
// - `node.rs`:      SupportNode: registrations and the aggregate value.
// - `heap.rs`:      IndexedMaxHeap: max-heap with keyed update/removal.
// - `spatial.rs`:   SupportIndex: octree over node positions.
// - `cascade.rs`:   CascadeQueue (deferred, deduplicated work) + CascadeReport.
// - `template.rs`:  SupportPointSpec, StructureTemplate presets, TemplateRegistry.
// - `config.rs`:    NetworkConfig, IndexConfig, CollapsePolicy.
// - `command.rs`:   NetworkCommand: serializable batch input.
// - `event.rs`:     NetworkEvent: emitted notifications.
// - `error.rs`:     SupportError and the `invariant_violation!` macro.
// - `types.rs`:     Vec3, Rotation, Transform, handles, SupportKey.
//
// The crate has no engine dependencies. Rendering, input and placement UI
// live in a collaborator layer that holds handles and drives the network
// through its methods or `NetworkCommand` batches.
//
// **Critical constraint: determinism.** The network is a pure function:
// `(state, commands) -> (new_state, events)`. No system time, no
// randomness, no hash-order iteration. Use `BTreeMap` for ordered
// collections.

pub mod cascade;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod heap;
pub mod network;
pub mod node;
pub mod spatial;
pub mod structure;
pub mod template;
pub mod types;

pub use command::NetworkCommand;
pub use config::{CollapsePolicy, IndexConfig, NetworkConfig};
pub use error::{Result, SupportError};
pub use event::{NetworkEvent, NetworkEventKind};
pub use network::{StepResult, SupportNetwork};
pub use template::{StructureTemplate, SupportPointSpec};
pub use types::{NodeId, Rotation, StructureId, TemplateId, Vec3};
