use crate::error::PoolResult;
use serde::{Deserialize, Serialize};

/// Lifetime used when an instance reports no usable sub-effect timing
pub const FALLBACK_LIFETIME_SECS: f64 = 2.0;

/// Router-wide settings.
///
/// Every field has a default, so a partial JSON object such as
/// `{"default_capacity": 8}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Instances pre-created by pools the router creates on demand
    pub default_capacity: usize,
    /// Report repeated/stale releases for pools created on demand
    pub collision_checks: bool,
    /// Warm registered presets when `warmup_presets` runs
    pub prewarm_presets: bool,
    /// Minimum safety lifetime in seconds
    pub fallback_lifetime_secs: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_capacity: 0,
            collision_checks: true,
            prewarm_presets: true,
            fallback_lifetime_secs: FALLBACK_LIFETIME_SECS,
        }
    }
}

impl RouterConfig {
    pub fn from_json(json: &str) -> PoolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Statically configured pool entry, keyed by a resource path.
///
/// The Godot facade turns these into presets once the scene is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub name: String,
    /// Resource path of the effect scene (e.g. "res://fx/blood_splash.tscn")
    pub scene: String,
    #[serde(default)]
    pub prewarm: usize,
    #[serde(default = "default_true")]
    pub collision_checks: bool,
}

fn default_true() -> bool {
    true
}

impl PresetConfig {
    /// Parse a JSON array of preset entries
    pub fn list_from_json(json: &str) -> PoolResult<Vec<Self>> {
        Ok(serde_json::from_str(json)?)
    }
}
