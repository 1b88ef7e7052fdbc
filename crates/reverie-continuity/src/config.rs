//! Continuity configuration

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    /// Seconds between periodic snapshots.
    pub cadence_secs: u64,
    /// A snapshot write slower than this counts as failed.
    pub snapshot_timeout_ms: u64,
    /// Snapshot file name inside the state directory.
    pub file_name: String,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            cadence_secs: 30,
            snapshot_timeout_ms: 5000,
            file_name: "reverie-state.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ContinuityConfig = serde_json::from_str(r#"{"cadence_secs": 5}"#).unwrap();
        assert_eq!(config.cadence_secs, 5);
        assert_eq!(config.snapshot_timeout_ms, 5000);
        assert_eq!(config.file_name, "reverie-state.json");
    }
}
