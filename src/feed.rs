//! JSONL observation feed
//!
//! One record per line:
//!
//! ```json
//! {"category":"aesthetic","descriptors":["spiral"],"intensity":0.8,"timestamp":"2026-03-01T12:00:00Z"}
//! ```
//!
//! `id` and `timestamp` are optional and filled in when absent. Blank lines and
//! lines starting with `#` are skipped. Malformed lines are counted and logged,
//! never fatal.
//!
//! The feed drives the engine's clock. A record refused for energy ticks the
//! engine to its timestamp and is retried once if the tick replenished
//! anything. The end of the feed ticks once more so queued syntheses get a
//! last chance and idle plans are suspended.

use anyhow::Context;
use chrono::{DateTime, Utc};
use reverie_core::{Category, Observation};
use reverie_engine::{AdmissionOutcome, CycleReport, SharedEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub category: Category,
    pub descriptors: Vec<String>,
    pub intensity: f64,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl FeedRecord {
    pub fn into_observation(self, fallback_time: DateTime<Utc>) -> Observation {
        Observation {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            timestamp: self.timestamp.unwrap_or(fallback_time),
            category: self.category,
            descriptors: self.descriptors,
            intensity: self.intensity,
            context: self.context,
        }
    }
}

/// Parse one line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str, fallback_time: DateTime<Utc>) -> anyhow::Result<Option<Observation>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let record: FeedRecord = serde_json::from_str(trimmed).context("malformed observation record")?;
    Ok(Some(record.into_observation(fallback_time)))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedStats {
    pub lines: u64,
    pub admitted: u64,
    pub refused_energy: u64,
    pub refused_invalid: u64,
    pub malformed: u64,
    pub intuitions: u64,
    pub plans_created: u64,
    pub plans_merged: u64,
    pub plans_suspended: u64,
    pub ticks: u64,
    /// Energy credited by passive replenishment during the replay.
    pub replenished: f64,
}

impl FeedStats {
    fn record_admission(&mut self, outcome: &AdmissionOutcome) {
        self.admitted += 1;
        self.record_cycle(&outcome.cycle);
    }

    fn record_tick(&mut self, report: &CycleReport) {
        self.ticks += 1;
        self.replenished += report.replenished;
        self.plans_suspended += report.suspended.len() as u64;
        self.record_cycle(report);
    }

    fn record_cycle(&mut self, cycle: &CycleReport) {
        self.intuitions += cycle.intuitions.len() as u64;
        for update in &cycle.plans {
            if update.created {
                self.plans_created += 1;
            } else {
                self.plans_merged += 1;
            }
        }
    }
}

/// Replay a feed into a shared engine, one admission per record.
pub async fn replay<R>(reader: R, engine: &SharedEngine) -> anyhow::Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = FeedStats::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("reading feed")? {
        stats.lines += 1;
        let observation = match parse_line(&line, Utc::now()) {
            Ok(Some(observation)) => observation,
            Ok(None) => continue,
            Err(e) => {
                stats.malformed += 1;
                warn!("Feed line {}: {:#}", stats.lines, e);
                continue;
            }
        };

        let mut handle = engine.lock().await;
        let at = observation.timestamp;
        match handle.admit(observation.clone()) {
            Ok(outcome) => stats.record_admission(&outcome),
            Err(refused) if refused.reason.is_backpressure() => {
                let report = handle.tick(at);
                stats.record_tick(&report);
                let retried = if report.replenished > 0.0 { handle.admit(observation).ok() } else { None };
                match retried {
                    Some(outcome) => stats.record_admission(&outcome),
                    None => stats.refused_energy += 1,
                }
            }
            Err(_) => stats.refused_invalid += 1,
        }
    }

    let mut handle = engine.lock().await;
    if let Some(clock) = handle.clock() {
        let report = handle.tick(clock);
        stats.record_tick(&report);
    }
    debug!("Feed finished: {:?}", stats);
    Ok(stats)
}
