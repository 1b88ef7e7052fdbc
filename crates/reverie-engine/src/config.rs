//! Engine configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. The scoring coefficients
//! are tunables; only the monotonicity of the formulas is relied upon.

use reverie_core::time::MAX_INTERVAL_SECS;
use reverie_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Energy budget.
    pub ledger: LedgerConfig,
    /// Observation window and input validation.
    pub window: WindowConfig,
    /// Pattern matching and scoring.
    pub detector: DetectorConfig,
    /// Intuition thresholds, costs, and retries.
    pub synthesis: SynthesisConfig,
    /// Plan decomposition.
    pub planning: PlanningConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Balance of a freshly created engine.
    pub initial_balance: f64,
    /// Ledger entries kept in the history tail.
    pub history_capacity: usize,
    /// Energy credited per minute of clock advance on `tick`. 0 disables.
    pub replenish_per_minute: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Maximum observations in the window.
    pub capacity: usize,
    /// Observations older than this (relative to the engine clock) are evicted.
    pub horizon_secs: u64,
    /// Energy debited per admitted observation.
    pub admission_cost: f64,
    /// Maximum descriptor tags per observation.
    pub max_tags: usize,
    /// Maximum bytes per tag.
    pub max_tag_len: usize,
    /// Maximum context entries per observation.
    pub max_context_entries: usize,
    /// Maximum distinct tags across the whole window.
    pub max_vocabulary: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Maximum gap between consecutive observations of one run.
    pub locality_secs: u64,
    /// `k` in the saturating support term `1 - exp(-k * n)`.
    pub support_rate: f64,
    pub support_weight: f64,
    pub intensity_weight: f64,
    pub recency_weight: f64,
    /// Time constant of the recency decay from `last_seen`.
    pub recency_tau_secs: f64,
    /// Net intensity rise needed for creative momentum.
    pub min_momentum_rise: f64,
    /// Minimum intensity for a relational resonance member.
    pub resonance_floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Minimum strength (and combined quality) for synthesis.
    pub threshold: f64,
    /// Minimum strength for a companion pattern to join a seed.
    pub companion_floor: f64,
    /// Companions per seed (up to 3 patterns combined).
    pub max_companions: usize,
    /// Energy debited per synthesis.
    pub synthesis_cost: f64,
    /// Wisdom reward is `factor * quality_score`.
    pub wisdom_reward_factor: f64,
    /// An intuition blocks re-synthesis of its lineage for this long.
    pub intuition_ttl_secs: u64,
    /// Time constant for the persistence bonus in manifestation readiness.
    pub persistence_tau_secs: f64,
    /// Refusals tolerated before a queued candidate is dropped.
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanningConfig {
    /// `quality * creative_potential` above this yields two synthesis steps.
    pub moderate_threshold: f64,
    /// ... and above this, three.
    pub complex_threshold: f64,
    /// Active plans untouched for this long are suspended on `tick`. 0 disables.
    pub idle_suspend_secs: u64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { initial_balance: 100.0, history_capacity: 256, replenish_per_minute: 0.0 }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            horizon_secs: 600,
            admission_cost: 1.0,
            max_tags: 16,
            max_tag_len: 64,
            max_context_entries: 32,
            max_vocabulary: 1024,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            locality_secs: 120,
            support_rate: 0.5,
            support_weight: 0.4,
            intensity_weight: 0.4,
            recency_weight: 0.2,
            recency_tau_secs: 300.0,
            min_momentum_rise: 0.05,
            resonance_floor: 0.5,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            companion_floor: 0.5,
            max_companions: 2,
            synthesis_cost: 25.0,
            wisdom_reward_factor: 25.0,
            intuition_ttl_secs: 1200,
            persistence_tau_secs: 300.0,
            max_retries: 3,
        }
    }
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self { moderate_threshold: 0.6, complex_threshold: 0.8, idle_suspend_secs: 600 }
    }
}

// ============================================================
// Loading
// ============================================================

impl EngineConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded engine config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No engine config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if !(self.ledger.initial_balance.is_finite() && self.ledger.initial_balance >= 0.0) {
            return fail("ledger.initial_balance must be finite and >= 0");
        }
        if self.window.capacity == 0 {
            return fail("window.capacity must be > 0");
        }
        if self.window.horizon_secs == 0 {
            return fail("window.horizon_secs must be > 0");
        }
        let intervals = [
            ("window.horizon_secs", self.window.horizon_secs),
            ("detector.locality_secs", self.detector.locality_secs),
            ("synthesis.intuition_ttl_secs", self.synthesis.intuition_ttl_secs),
            ("planning.idle_suspend_secs", self.planning.idle_suspend_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs > MAX_INTERVAL_SECS) {
            return Err(Error::Config(format!("{} must be at most {}", name, MAX_INTERVAL_SECS)));
        }
        if !(self.ledger.replenish_per_minute.is_finite() && self.ledger.replenish_per_minute >= 0.0) {
            return fail("ledger.replenish_per_minute must be finite and >= 0");
        }
        if !(self.window.admission_cost.is_finite() && self.window.admission_cost >= 0.0) {
            return fail("window.admission_cost must be finite and >= 0");
        }
        if self.window.max_tags == 0 || self.window.max_tag_len == 0 {
            return fail("window.max_tags and window.max_tag_len must be > 0");
        }
        let weights = self.detector.support_weight + self.detector.intensity_weight + self.detector.recency_weight;
        if !(weights.is_finite() && weights > 0.0) {
            return fail("detector weights must sum to a positive number");
        }
        if self.detector.recency_tau_secs <= 0.0 || self.synthesis.persistence_tau_secs <= 0.0 {
            return fail("time constants must be > 0");
        }
        if !(0.0..=1.0).contains(&self.synthesis.threshold) {
            return fail("synthesis.threshold must lie in [0, 1]");
        }
        if !(self.synthesis.synthesis_cost.is_finite() && self.synthesis.synthesis_cost >= 0.0) {
            return fail("synthesis.synthesis_cost must be finite and >= 0");
        }
        Ok(())
    }

    /// Builder used by tests and embedders.
    pub fn with_initial_balance(mut self, balance: f64) -> Self {
        self.ledger.initial_balance = balance;
        self
    }
}
