// Error types for the support network.
//
// `SupportError` covers the two recoverable categories: configuration errors
// (bad template or network config, rejected before anything is registered)
// and contract violations by the caller (unknown handles, removing a node
// that still has registrations). Both propagate as `Result` with `?`.
//
// Not-found on spatial queries is not an error: those return `Option`.
//
// Registration-map desync between a node and a structure is a bug in cascade
// processing, not bad input, so it never becomes a `SupportError`. It goes
// through `invariant_violation!`, which logs at error level and fails a
// `debug_assert!` so test and debug builds stop at the first occurrence.

use crate::types::{NodeId, StructureId, TemplateId};
use thiserror::Error;

/// Errors returned by `SupportNetwork` and `TemplateRegistry`.
#[derive(Error, Debug)]
pub enum SupportError {
    #[error("unknown template: {0}")]
    UnknownTemplate(TemplateId),

    #[error("invalid template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("template '{0}' is already registered")]
    DuplicateTemplate(String),

    #[error("{template} still has {instances} live instance(s)")]
    TemplateInUse { template: TemplateId, instances: u32 },

    #[error("unknown structure: {0}")]
    UnknownStructure(StructureId),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("{node} still has {registrations} active registration(s)")]
    NodeInUse { node: NodeId, registrations: usize },

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    #[error("invalid placement: {0}")]
    InvalidPlacement(String),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupportError>;

/// Report a broken network invariant.
///
/// Logs through `tracing` under the `keystone_support::invariant` target and
/// then trips a debug assertion. Release builds keep running after logging.
#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        ::tracing::error!(target: "keystone_support::invariant", $($arg)*);
        debug_assert!(false, $($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_handle() {
        let err = SupportError::NodeInUse {
            node: NodeId(3),
            registrations: 2,
        };
        assert_eq!(err.to_string(), "NodeId(3) still has 2 active registration(s)");

        let err = SupportError::UnknownStructure(StructureId(9));
        assert_eq!(err.to_string(), "unknown structure: StructureId(9)");
    }

    #[test]
    fn json_errors_convert() {
        fn parse(s: &str) -> Result<serde_json::Value> {
            Ok(serde_json::from_str(s)?)
        }
        assert!(matches!(parse("{"), Err(SupportError::Json(_))));
    }
}
