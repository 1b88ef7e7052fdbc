//! Versioned snapshot layout
//!
//! ```json
//! { "schema_version": 1, "saved_at": "...", "clock": "...",
//!   "ledger": {...}, "observations": [...], "patterns": [...],
//!   "plans": [{"plan": {...}, "intuition": {...}}],
//!   "synthesis": {"recent": [...], "pending": [...], "settled": [...]} }
//! ```
//!
//! The version is checked before the body is decoded, so a snapshot from a
//! newer layout is rejected as such rather than as malformed JSON.

use chrono::{DateTime, Utc};
use reverie_core::PersistenceError;
use reverie_engine::{EngineConfig, EngineHandle, EngineState};
use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedState {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: EngineState,
}

impl SerializedState {
    /// Capture the engine. Only open plans are exported. Each is stored with
    /// `session_span` one above the live value, which is left untouched, so
    /// the count grows once per restart rather than once per snapshot.
    pub fn capture(engine: &EngineHandle, saved_at: DateTime<Utc>) -> Self {
        let mut state = engine.export_state();
        state.plans.retain(|e| !e.plan.status.is_terminal());
        for entry in &mut state.plans {
            entry.plan.session_span += 1;
        }
        Self { schema_version: SCHEMA_VERSION, saved_at, state }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let found = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| PersistenceError::corrupt("missing schema_version"))?;
        if found != u64::from(SCHEMA_VERSION) {
            return Err(PersistenceError::UnknownSchemaVersion {
                found: u32::try_from(found).unwrap_or(u32::MAX),
                supported: SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Validate and rebuild an engine from this snapshot.
    pub fn into_engine(self, config: EngineConfig) -> Result<EngineHandle, PersistenceError> {
        EngineHandle::from_state(config, self.state)
    }
}
