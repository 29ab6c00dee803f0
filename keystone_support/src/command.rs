// Commands that mutate the support network.
//
// `NetworkCommand` is the serializable form of every external mutation: the
// same operations as the direct methods on `SupportNetwork`, packaged so a
// collaborator can record, replay, or ship a batch of them. A batch goes
// through `SupportNetwork::apply()`, which runs each command in order and
// returns a `StepResult` with the events, the ids of placed structures, the
// indices of rejected commands, and a combined cascade report.
//
// Current commands:
// - `AddStructure`: place a registered template at a position and rotation.
// - `RemoveStructure`: take a structure out and run the cascade. On debris
//   this clears it instead.
// - `SeverNode`: destroy a node from outside (terrain gone, blast damage).
// - `ClearDebris`: discard a debris record.
//
// A rejected command (unknown id, bad placement) has no effect and does not
// stop the batch.
//
// See also: `network.rs` for `apply()` and the methods these map onto,
// `event.rs` for the resulting notifications.
//
// **Critical constraint: determinism.** Commands are the sole external input
// to a network driven through `apply()`. Replaying the same batches against
// the same config yields identical events.

use crate::types::*;
use serde::{Deserialize, Serialize};

/// One external mutation of the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NetworkCommand {
    /// Place a new structure.
    AddStructure {
        template: TemplateId,
        position: Vec3,
        #[serde(default)]
        rotation: Rotation,
    },
    /// Remove a placed structure (or clear a debris record).
    RemoveStructure { structure: StructureId },
    /// Destroy a node regardless of who is registered on it.
    SeverNode { node: NodeId },
    /// Discard a debris record.
    ClearDebris { structure: StructureId },
}

impl NetworkCommand {
    /// Parse a JSON array of commands, e.g. a recorded session.
    pub fn batch_from_json(json: &str) -> crate::error::Result<Vec<NetworkCommand>> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_defaults_to_identity() {
        let json = r#"[
            {"AddStructure": {"template": 0, "position": {"x": 1.0, "y": 0.0, "z": 2.0}}},
            {"SeverNode": {"node": 3}}
        ]"#;
        let batch = NetworkCommand::batch_from_json(json).unwrap();
        assert_eq!(
            batch,
            vec![
                NetworkCommand::AddStructure {
                    template: TemplateId(0),
                    position: Vec3::new(1.0, 0.0, 2.0),
                    rotation: Rotation::IDENTITY,
                },
                NetworkCommand::SeverNode { node: NodeId(3) },
            ]
        );
    }

    #[test]
    fn malformed_batch_is_an_error() {
        assert!(NetworkCommand::batch_from_json(r#"[{"Explode": {}}]"#).is_err());
    }
}
