//! Reverie Engine: energy-gated temporal pattern recognition and planning
//!
//! Pipeline, one pass per admitted observation or tick:
//! - ObservationBuffer: admission gated by the ResourceLedger, sliding window
//! - PatternDetector: incremental re-matching of touched categories
//! - IntuitionSynthesizer: threshold crossing, energy debit, wisdom reward
//! - PlanningBuffer: three-tier plans, merged per lineage
//!
//! The reasoning core is single-threaded per EngineHandle. Independent handles
//! share nothing and are kept in an EngineRegistry, one per agent.

pub mod buffer;
pub mod config;
pub mod detector;
pub mod engine;
pub mod ledger;
pub mod planning;
pub mod registry;
pub mod synthesizer;

pub use buffer::{AdmissionReceipt, BufferedObservation, Eviction, ObservationBuffer};
pub use config::{DetectorConfig, EngineConfig, LedgerConfig, PlanningConfig, SynthesisConfig, WindowConfig};
pub use detector::{PatternDelta, PatternDetector};
pub use engine::{AdmissionOutcome, CycleReport, EngineCounters, EngineHandle, EngineState, EngineStatus, PlanSummary};
pub use ledger::{LedgerState, ResourceLedger};
pub use planning::{NextAction, PlanEntry, PlanUpdate, PlanningBuffer};
pub use registry::{EngineRegistry, SharedEngine};
pub use synthesizer::{IntuitionSynthesizer, PendingSynthesis, SettledLineage, SynthesisOutcome, SynthesisState};
