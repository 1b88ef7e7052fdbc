//! ContinuityManager: persists and restores one engine
//!
//! `snapshot` is pure. `persist` writes under a timeout; a failed write is
//! returned, counted and logged, and the engine keeps running. `restore`
//! validates before anything is handed back: a snapshot that fails validation
//! is fatal for that instance and surfaces to the caller.

use crate::config::ContinuityConfig;
use crate::state::SerializedState;
use crate::store::{FileStore, SnapshotStore};
use chrono::{DateTime, Utc};
use reverie_core::{Health, PersistenceError};
use reverie_engine::{EngineConfig, EngineHandle, SharedEngine};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityStatus {
    pub snapshots_written: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_saved_at: Option<DateTime<Utc>>,
    /// The last restore failed. Cleared by the next successful restore.
    #[serde(default)]
    pub restore_failed: bool,
}

impl ContinuityStatus {
    /// `Degraded` while snapshots are failing or the stored state could not be
    /// restored; `None` when persistence is fine.
    pub fn degradation(&self) -> Option<Health> {
        if self.consecutive_failures == 0 && !self.restore_failed {
            return None;
        }
        Some(Health::Degraded {
            reason: self
                .last_error
                .clone()
                .unwrap_or_else(|| "snapshot failing".to_string()),
        })
    }
}

pub struct ContinuityManager {
    store: Arc<dyn SnapshotStore>,
    config: ContinuityConfig,
    status: Mutex<ContinuityStatus>,
}

impl ContinuityManager {
    pub fn new(store: Arc<dyn SnapshotStore>, config: ContinuityConfig) -> Self {
        Self { store, config, status: Mutex::new(ContinuityStatus::default()) }
    }

    /// Manager backed by `<dir>/<file_name>`.
    pub fn in_dir(dir: &Path, config: ContinuityConfig) -> Self {
        let store = Arc::new(FileStore::in_dir(dir, &config.file_name));
        Self::new(store, config)
    }

    pub fn config(&self) -> &ContinuityConfig {
        &self.config
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    pub async fn status(&self) -> ContinuityStatus {
        self.status.lock().await.clone()
    }

    /// Capture the engine without side effects.
    pub fn snapshot(&self, engine: &EngineHandle) -> SerializedState {
        SerializedState::capture(engine, Utc::now())
    }

    /// Snapshot and write.
    pub async fn persist(&self, engine: &EngineHandle) -> Result<(), PersistenceError> {
        let state = self.snapshot(engine);
        self.write(&state).await
    }

    /// Write a captured snapshot under the configured timeout and record the outcome.
    pub async fn write(&self, state: &SerializedState) -> Result<(), PersistenceError> {
        let result = self.timed_save(state).await;
        let mut status = self.status.lock().await;
        match &result {
            Ok(()) => {
                status.snapshots_written += 1;
                status.consecutive_failures = 0;
                status.last_error = None;
                status.last_saved_at = Some(state.saved_at);
                info!(
                    "Snapshot written to {} ({} observations, {} patterns, {} plans)",
                    self.store.location(),
                    state.state.observations.len(),
                    state.state.patterns.len(),
                    state.state.plans.len()
                );
            }
            Err(e) => {
                status.consecutive_failures += 1;
                status.last_error = Some(e.to_string());
                warn!(
                    "Snapshot to {} failed ({} in a row): {}",
                    self.store.location(),
                    status.consecutive_failures,
                    e
                );
            }
        }
        result
    }

    async fn timed_save(&self, state: &SerializedState) -> Result<(), PersistenceError> {
        let bytes = state.to_json()?;
        let limit = Duration::from_millis(self.config.snapshot_timeout_ms);
        match tokio::time::timeout(limit, self.store.save(&bytes)).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Timeout { after_ms: self.config.snapshot_timeout_ms }),
        }
    }

    /// The stored snapshot, decoded and version-checked. `None` for a fresh store.
    pub async fn load(&self) -> Result<Option<SerializedState>, PersistenceError> {
        match self.store.load().await? {
            Some(bytes) => SerializedState::from_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Load and rebuild an engine. `None` for a fresh store.
    pub async fn restore(&self, config: EngineConfig) -> Result<Option<EngineHandle>, PersistenceError> {
        let result = match self.load().await {
            Ok(Some(state)) => {
                let saved_at = state.saved_at;
                state.into_engine(config).map(|engine| {
                    info!("Restored engine from {} (saved {})", self.store.location(), saved_at);
                    Some(engine)
                })
            }
            Ok(None) => {
                info!("No snapshot at {}, starting fresh", self.store.location());
                Ok(None)
            }
            Err(e) => Err(e),
        };
        let mut status = self.status.lock().await;
        match &result {
            Ok(_) => status.restore_failed = false,
            Err(e) => {
                error!("Restore from {} failed: {}", self.store.location(), e);
                status.restore_failed = true;
                status.last_error = Some(format!("restore failed: {}", e));
            }
        }
        drop(status);
        result
    }

    /// Persist the shared engine every `cadence_secs` until `cancel` fires,
    /// then write a final snapshot.
    pub fn spawn_cadence(self: Arc<Self>, engine: SharedEngine, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.cadence_secs.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let state = {
                            let guard = engine.lock().await;
                            self.snapshot(&guard)
                        };
                        if self.write(&state).await.is_ok() {
                            info!("Final snapshot written");
                        }
                        break;
                    }
                    _ = interval.tick() => {
                        let state = {
                            let guard = engine.lock().await;
                            self.snapshot(&guard)
                        };
                        debug!("Cadence snapshot");
                        // Failures are recorded in the status; the loop carries on.
                        let _ = self.write(&state).await;
                    }
                }
            }
        })
    }
}
