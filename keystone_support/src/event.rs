// Network events: the observable output of the support network.
//
// Every externally triggered mutation (placing or removing a structure,
// severing a node, clearing debris) bumps the network's `tick` and may emit
// a batch of `NetworkEvent`s. They are the notifications the collaborator
// layer reacts to: spawn a falling-debris effect on `StructureCollapsed`,
// refresh a preview on `NodeValueChanged`, and so on. The network itself
// never reads them back.
//
// Guarantees callers can rely on:
// - A structure produces exactly one of `StructureRemoved` /
//   `StructureCollapsed` over its lifetime, never both and never twice.
// - `NodeValueChanged` is emitted only when the aggregate value actually
//   moves, never for a registration that leaves the maximum where it was.
// - `NodeDestroyed` follows the last unregistration of a node, after which
//   the node id never appears again.
//
// See also: `network.rs` which emits these, `command.rs` for the inputs that
// trigger them.
//
// **Critical constraint: determinism.** Events are appended in processing
// order, which is fully determined by the command sequence.

use crate::config::CollapsePolicy;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// A notification emitted by the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// Mutation counter at the time of the event.
    pub tick: u64,
    pub kind: NetworkEventKind,
}

/// Types of network notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NetworkEventKind {
    /// A structure was placed and registered on all its support points.
    StructureAdded {
        structure_id: StructureId,
        template_id: TemplateId,
    },
    /// A structure was removed by the caller.
    StructureRemoved { structure_id: StructureId },
    /// A structure lost its support during a cascade.
    StructureCollapsed {
        structure_id: StructureId,
        policy: CollapsePolicy,
    },
    /// A debris record was discarded.
    DebrisCleared { structure_id: StructureId },
    /// A new support node was created.
    NodeCreated { node_id: NodeId, position: Vec3 },
    /// A node's aggregate value changed.
    NodeValueChanged { node_id: NodeId, old: f32, new: f32 },
    /// A node's last registration went away; it has been evicted.
    NodeDestroyed { node_id: NodeId },
    /// A node was destroyed from outside while structures were still bound.
    NodeSevered { node_id: NodeId },
}

impl NetworkEventKind {
    /// The structure a structure-level event is about.
    pub fn structure(&self) -> Option<StructureId> {
        match *self {
            Self::StructureAdded { structure_id, .. }
            | Self::StructureRemoved { structure_id }
            | Self::StructureCollapsed { structure_id, .. }
            | Self::DebrisCleared { structure_id } => Some(structure_id),
            _ => None,
        }
    }

    /// Whether this event ends a structure's life in the network.
    pub fn is_structure_destruction(&self) -> bool {
        matches!(
            self,
            Self::StructureRemoved { .. } | Self::StructureCollapsed { .. }
        )
    }
}
