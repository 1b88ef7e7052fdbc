//! Reverie Continuity: snapshots that carry an engine across restarts
//!
//! - SerializedState: versioned, self-describing JSON layout of one engine
//! - SnapshotStore: where the bytes go (file with atomic rename, or memory)
//! - ContinuityManager: timed writes, restore with validation, cadence task
//!
//! Snapshot failures never stop the engine; they are counted and surface as
//! a degraded status.

pub mod config;
pub mod manager;
pub mod state;
pub mod store;

pub use config::ContinuityConfig;
pub use manager::{ContinuityManager, ContinuityStatus};
pub use state::{SerializedState, SCHEMA_VERSION};
pub use store::{FileStore, MemoryStore, SnapshotStore};
