// Data-driven network configuration.
//
// All tunable support-network parameters live in `NetworkConfig`, loaded
// from JSON at startup. The network never hardcodes a reuse radius or index
// shape; it reads them from here. Structure definitions are not config;
// they live in `template.rs`.
//
// Parameters are grouped the same way the code is:
// - `search_radius`: how close a support point must be to an existing node
//   to reuse it instead of creating a new one.
// - `collapse_policy`: what becomes of a structure that loses its support
//   (deleted outright, or kept as inert debris for the collaborator layer).
// - `index`: octree shape (`IndexConfig`). Capacity and depth only affect
//   performance, never results.
//
// See also: `network.rs` which owns the `NetworkConfig`, `spatial.rs` for
// the octree that reads `IndexConfig`.
//
// **Critical constraint: determinism.** Two networks fed the same config and
// the same commands produce identical state and events.

use crate::error::{Result, SupportError};
use crate::types::Vec3;
use serde::{Deserialize, Serialize};

/// What happens to a structure once the cascade decides it is unsupported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollapsePolicy {
    /// The structure record is discarded.
    #[default]
    Delete,
    /// The record stays in the network as unbound debris until
    /// `clear_debris()` is called.
    Debris,
}

/// Shape of the octree behind the spatial support index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Center of the initial root cube.
    pub center: Vec3,
    /// Half the side length of the initial root cube. The root grows past
    /// this on demand.
    pub half_extent: f32,
    /// Entries a leaf holds before splitting.
    pub leaf_capacity: usize,
    /// Maximum branch depth. Leaves at this depth never split.
    pub max_depth: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            half_extent: 256.0,
            leaf_capacity: 8,
            max_depth: 12,
        }
    }
}

/// Top-level support network configuration. Loaded from JSON, never mutated
/// at runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Support points within this distance of an existing node share it.
    pub search_radius: f32,

    /// Fate of structures that lose their support.
    #[serde(default)]
    pub collapse_policy: CollapsePolicy,

    /// Octree parameters.
    #[serde(default)]
    pub index: IndexConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            search_radius: 0.1,
            collapse_policy: CollapsePolicy::Delete,
            index: IndexConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Parse and validate a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the network cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.search_radius.is_finite() && self.search_radius > 0.0) {
            return Err(SupportError::InvalidConfig(format!(
                "search_radius must be a positive finite distance, got {}",
                self.search_radius
            )));
        }
        if !self.index.center.is_finite() {
            return Err(SupportError::InvalidConfig(
                "index.center must be finite".into(),
            ));
        }
        if !(self.index.half_extent.is_finite() && self.index.half_extent > 0.0) {
            return Err(SupportError::InvalidConfig(format!(
                "index.half_extent must be positive, got {}",
                self.index.half_extent
            )));
        }
        if self.index.leaf_capacity == 0 {
            return Err(SupportError::InvalidConfig(
                "index.leaf_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips() {
        let config = NetworkConfig::default();
        let json = config.to_json().unwrap();
        let restored = NetworkConfig::from_json(&json).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn config_loads_from_json_string() {
        let json = r#"{
            "search_radius": 0.25,
            "collapse_policy": "Debris",
            "index": {
                "center": { "x": 0.0, "y": 32.0, "z": 0.0 },
                "half_extent": 64.0,
                "leaf_capacity": 4,
                "max_depth": 8
            }
        }"#;
        let config = NetworkConfig::from_json(json).unwrap();
        assert_eq!(config.search_radius, 0.25);
        assert_eq!(config.collapse_policy, CollapsePolicy::Debris);
        assert_eq!(config.index.leaf_capacity, 4);
        assert_eq!(config.index.center.y, 32.0);
    }

    #[test]
    fn omitted_sections_use_defaults() {
        let config = NetworkConfig::from_json(r#"{ "search_radius": 0.5 }"#).unwrap();
        assert_eq!(config.collapse_policy, CollapsePolicy::Delete);
        assert_eq!(config.index, IndexConfig::default());
    }

    #[test]
    fn rejects_non_positive_radius() {
        let err = NetworkConfig::from_json(r#"{ "search_radius": 0.0 }"#).unwrap_err();
        assert!(matches!(err, SupportError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_leaf_capacity() {
        let config = NetworkConfig {
            index: IndexConfig {
                leaf_capacity: 0,
                ..IndexConfig::default()
            },
            ..NetworkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = NetworkConfig::from_json("{ search_radius: ").unwrap_err();
        assert!(matches!(err, SupportError::Json(_)));
    }
}
