//! EngineHandle: one agent's pipeline
//!
//! Owns the ledger, window, detector, synthesizer and planning buffer. Every
//! admitted observation and every tick runs one cycle:
//! admit/evict -> detector update -> synthesis -> plan acceptance.
//!
//! Time is logical: the engine clock is the maximum of admitted observation
//! timestamps and tick times, so replays are deterministic.

use crate::buffer::{AdmissionReceipt, ObservationBuffer};
use crate::config::EngineConfig;
use crate::detector::{PatternDelta, PatternDetector};
use crate::ledger::{LedgerState, ResourceLedger};
use crate::planning::{NextAction, PlanEntry, PlanUpdate, PlanningBuffer};
use crate::synthesizer::{IntuitionSynthesizer, PendingSynthesis, SynthesisState};
use chrono::{DateTime, Utc};
use reverie_core::{
    Category, DetectedPattern, Health, Intuition, InvalidTransition, LedgerReason, Lineage, Observation, PersistenceError,
    Plan, PlanStatus, Refused,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything one cycle produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub at: Option<DateTime<Utc>>,
    /// Passive replenishment credited by a tick.
    pub replenished: f64,
    pub evicted: Vec<Uuid>,
    pub patterns: PatternDelta,
    pub intuitions: Vec<Intuition>,
    pub plans: Vec<PlanUpdate>,
    /// Lineages refused for energy and queued for retry.
    pub queued: Vec<Lineage>,
    pub cancelled: Vec<Lineage>,
    pub dropped: Vec<Lineage>,
    /// Active plans suspended by a tick for sitting idle.
    pub suspended: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionOutcome {
    pub receipt: AdmissionReceipt,
    pub cycle: CycleReport,
}

/// Monotonic counters since the handle was created or restored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub cycles: u64,
    pub admitted: u64,
    pub refused_energy: u64,
    pub refused_invalid: u64,
    pub evicted: u64,
    pub intuitions: u64,
    pub plans_created: u64,
    pub plans_merged: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub id: Uuid,
    pub lineage: Lineage,
    pub intuition_id: Uuid,
    pub status: PlanStatus,
    pub steps: usize,
    pub completed_steps: usize,
    pub session_span: u32,
}

impl From<&Plan> for PlanSummary {
    fn from(plan: &Plan) -> Self {
        Self {
            id: plan.id,
            lineage: plan.lineage.clone(),
            intuition_id: plan.intuition_id,
            status: plan.status,
            steps: plan.steps.len(),
            completed_steps: plan.completed_steps(),
            session_span: plan.session_span,
        }
    }
}

/// Observability view. Owned copies only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub clock: Option<DateTime<Utc>>,
    pub balance: f64,
    pub health: Health,
    pub window_len: usize,
    pub window_capacity: usize,
    pub patterns: Vec<DetectedPattern>,
    pub plans: Vec<PlanSummary>,
    pub pending_syntheses: Vec<PendingSynthesis>,
    pub counters: EngineCounters,
}

/// Exported engine state: what continuity persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub clock: Option<DateTime<Utc>>,
    pub ledger: LedgerState,
    pub observations: Vec<Observation>,
    pub patterns: Vec<DetectedPattern>,
    pub plans: Vec<PlanEntry>,
    #[serde(default)]
    pub synthesis: SynthesisState,
}

#[derive(Debug)]
pub struct EngineHandle {
    config: EngineConfig,
    clock: Option<DateTime<Utc>>,
    /// Clock value up to which passive replenishment has been credited.
    replenished_through: Option<DateTime<Utc>>,
    ledger: ResourceLedger,
    buffer: ObservationBuffer,
    detector: PatternDetector,
    synthesizer: IntuitionSynthesizer,
    planning: PlanningBuffer,
    counters: EngineCounters,
}

impl EngineHandle {
    pub fn new(config: EngineConfig) -> Self {
        let ledger = ResourceLedger::new(config.ledger.initial_balance, config.ledger.history_capacity);
        Self {
            clock: None,
            replenished_through: None,
            ledger,
            buffer: ObservationBuffer::new(config.window.clone()),
            detector: PatternDetector::new(config.detector.clone()),
            synthesizer: IntuitionSynthesizer::new(config.synthesis.clone(), config.detector.locality_secs),
            planning: PlanningBuffer::new(config.planning.clone()),
            counters: EngineCounters::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Admit one observation and run a cycle. Refusal leaves the engine unchanged.
    pub fn admit(&mut self, observation: Observation) -> Result<AdmissionOutcome, Refused> {
        let now = self.clock.map_or(observation.timestamp, |c| c.max(observation.timestamp));
        let (receipt, eviction) = match self.buffer.admit(observation, &mut self.ledger, now) {
            Ok(admitted) => admitted,
            Err(refused) => {
                if refused.reason.is_backpressure() {
                    self.counters.refused_energy += 1;
                    debug!("{}", refused);
                } else {
                    self.counters.refused_invalid += 1;
                    warn!("{}", refused);
                }
                return Err(refused);
            }
        };
        self.clock = Some(now);
        if self.replenished_through.is_none() {
            self.replenished_through = Some(now);
        }
        self.counters.admitted += 1;

        let mut cycle = self.cycle(now, &eviction.touched);
        cycle.evicted = eviction.evicted;
        self.counters.evicted += cycle.evicted.len() as u64;
        Ok(AdmissionOutcome { receipt, cycle })
    }

    /// Advance the clock: replenish, evict, re-score, retry queued syntheses.
    pub fn tick(&mut self, now: DateTime<Utc>) -> CycleReport {
        let now = self.clock.map_or(now, |c| c.max(now));
        self.clock = Some(now);
        let replenished = self.replenish(now);

        let eviction = self.buffer.evict(now);
        let mut cycle = self.cycle(now, &eviction.touched);
        cycle.replenished = replenished;
        cycle.evicted = eviction.evicted;
        cycle.suspended = self.planning.suspend_idle(now);
        self.counters.evicted += cycle.evicted.len() as u64;
        cycle
    }

    /// External top-up of the energy balance.
    pub fn credit(&mut self, amount: f64) {
        let at = self.now();
        self.ledger.credit(amount, LedgerReason::External, at);
    }

    fn cycle(&mut self, now: DateTime<Utc>, touched: &BTreeSet<Category>) -> CycleReport {
        self.counters.cycles += 1;
        let patterns = self.detector.update(&self.buffer, touched, now);
        let synthesis = self.synthesizer.run(&self.detector, &mut self.ledger, now);

        let mut plans = Vec::with_capacity(synthesis.intuitions.len());
        for intuition in &synthesis.intuitions {
            let update = self.planning.accept(intuition.clone(), now);
            if update.created {
                self.counters.plans_created += 1;
            } else {
                self.counters.plans_merged += 1;
            }
            plans.push(update);
        }
        self.counters.intuitions += synthesis.intuitions.len() as u64;

        CycleReport {
            at: Some(now),
            replenished: 0.0,
            evicted: Vec::new(),
            patterns,
            intuitions: synthesis.intuitions,
            plans,
            queued: synthesis.queued,
            cancelled: synthesis.cancelled,
            dropped: synthesis.dropped,
            suspended: Vec::new(),
        }
    }

    fn replenish(&mut self, now: DateTime<Utc>) -> f64 {
        let rate = self.config.ledger.replenish_per_minute;
        let since = *self.replenished_through.get_or_insert(now);
        self.replenished_through = Some(now);
        let minutes = (now - since).num_milliseconds().max(0) as f64 / 60_000.0;
        let amount = rate * minutes;
        if amount > 0.0 && amount.is_finite() {
            self.ledger.credit(amount, LedgerReason::Replenishment, now);
            amount
        } else {
            0.0
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    // ============================================================
    // Observability
    // ============================================================

    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.clock
    }

    pub fn balance(&self) -> f64 {
        self.ledger.balance()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    pub fn patterns(&self) -> Vec<DetectedPattern> {
        self.detector.patterns()
    }

    pub fn window_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn observations(&self) -> Vec<Observation> {
        self.buffer.observations()
    }

    pub fn health(&self) -> Health {
        if self.ledger.balance() < self.config.window.admission_cost {
            Health::ResourceStarved
        } else {
            Health::Healthy
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            clock: self.clock,
            balance: self.ledger.balance(),
            health: self.health(),
            window_len: self.buffer.len(),
            window_capacity: self.buffer.capacity(),
            patterns: self.detector.patterns(),
            plans: self.planning.open_plans().iter().map(PlanSummary::from).collect(),
            pending_syntheses: self.synthesizer.pending(),
            counters: self.counters.clone(),
        }
    }

    // ============================================================
    // Plans (execution collaborator)
    // ============================================================

    pub fn plan(&self, plan_id: Uuid) -> Option<Plan> {
        self.planning.get(plan_id).cloned()
    }

    pub fn executable_plans(&self) -> Vec<Plan> {
        self.planning.executable_plans()
    }

    pub fn open_plans(&self) -> Vec<Plan> {
        self.planning.open_plans()
    }

    pub fn archived_plans(&self) -> Vec<Plan> {
        self.planning.archived_plans()
    }

    pub fn next_actions(&self, max: usize) -> Vec<NextAction> {
        self.planning.next_actions(max)
    }

    pub fn begin_step(&mut self, plan_id: Uuid, step: usize) -> Result<(), InvalidTransition> {
        let now = self.now();
        self.planning.begin_step(plan_id, step, now)
    }

    pub fn mark_step_complete(&mut self, plan_id: Uuid, step: usize) -> Result<PlanStatus, InvalidTransition> {
        let now = self.now();
        self.planning.mark_step_complete(plan_id, step, now)
    }

    pub fn suspend_plan(&mut self, plan_id: Uuid) -> Result<(), InvalidTransition> {
        let now = self.now();
        self.planning.suspend_plan(plan_id, now)
    }

    pub fn resume_plan(&mut self, plan_id: Uuid) -> Result<(), InvalidTransition> {
        let now = self.now();
        self.planning.resume_plan(plan_id, now)
    }

    pub fn abandon_plan(&mut self, plan_id: Uuid) -> Result<(), InvalidTransition> {
        let now = self.now();
        self.planning.abandon_plan(plan_id, now)
    }

    pub fn pending_syntheses(&self) -> Vec<PendingSynthesis> {
        self.synthesizer.pending()
    }

    pub fn cancel_pending(&mut self, lineage: &Lineage) -> bool {
        self.synthesizer.cancel_pending(lineage, &self.detector)
    }

    // ============================================================
    // Export / restore
    // ============================================================

    /// Copy out everything continuity needs. Pure.
    pub fn export_state(&self) -> EngineState {
        EngineState {
            clock: self.clock,
            ledger: self.ledger.state(),
            observations: self.buffer.observations(),
            patterns: self.detector.patterns(),
            plans: self.planning.entries().to_vec(),
            synthesis: self.synthesizer.state(),
        }
    }

    /// Rebuild a handle from exported state. Active plans come back suspended;
    /// observations past the horizon are dropped and trigger a re-match.
    pub fn from_state(config: EngineConfig, state: EngineState) -> Result<Self, PersistenceError> {
        validate_state(&state)?;

        let now = state
            .clock
            .or_else(|| state.observations.iter().map(|o| o.timestamp).max());
        let observation_count = state.observations.len();
        let (buffer, skipped) = match now {
            Some(now) => ObservationBuffer::restore(config.window.clone(), state.observations, now),
            None => (ObservationBuffer::new(config.window.clone()), observation_count),
        };

        let mut detector = PatternDetector::restore(config.detector.clone(), state.patterns);
        if skipped > 0 {
            if let Some(now) = now {
                let delta = detector.rescan(&buffer, now);
                info!(
                    "Dropped {} restored observations; re-matched patterns (-{})",
                    skipped,
                    delta.removed.len()
                );
            }
        }

        let handle = Self {
            clock: now,
            replenished_through: now,
            ledger: ResourceLedger::from_state(state.ledger, config.ledger.history_capacity),
            buffer,
            detector,
            synthesizer: IntuitionSynthesizer::restore(
                config.synthesis.clone(),
                config.detector.locality_secs,
                state.synthesis,
            ),
            planning: PlanningBuffer::restore(config.planning.clone(), state.plans),
            counters: EngineCounters::default(),
            config,
        };
        info!(
            "Restored engine: balance {:.2}, {} observations, {} patterns, {} open plans",
            handle.balance(),
            handle.window_len(),
            handle.detector.len(),
            handle.planning.open_count()
        );
        Ok(handle)
    }
}

fn validate_state(state: &EngineState) -> Result<(), PersistenceError> {
    let balance = state.ledger.balance;
    if !balance.is_finite() || balance < 0.0 {
        return Err(PersistenceError::corrupt(format!("ledger balance {} is not a finite non-negative number", balance)));
    }

    let mut ids = HashSet::with_capacity(state.observations.len());
    for o in &state.observations {
        if !o.intensity.is_finite() || !(0.0..=1.0).contains(&o.intensity) {
            return Err(PersistenceError::corrupt(format!("observation {} intensity {} out of range", o.id, o.intensity)));
        }
        if !ids.insert(o.id) {
            return Err(PersistenceError::corrupt(format!("observation {} appears twice", o.id)));
        }
    }

    for p in &state.patterns {
        if p.support() < 2 || !(0.0..=1.0).contains(&p.strength) {
            return Err(PersistenceError::corrupt(format!("pattern {} has invalid support or strength", p.key)));
        }
        if let Some(missing) = p.supporting_observation_ids.iter().find(|id| !ids.contains(*id)) {
            return Err(PersistenceError::corrupt(format!(
                "pattern {} references observation {} outside the window",
                p.key, missing
            )));
        }
    }

    let mut lineages = HashSet::new();
    for entry in &state.plans {
        let plan = &entry.plan;
        if !plan.is_acyclic() {
            return Err(PersistenceError::corrupt(format!("plan {} has a cyclic or dangling dependency", plan.id)));
        }
        if !plan.status.is_terminal() && !lineages.insert(plan.lineage.clone()) {
            return Err(PersistenceError::corrupt(format!("two open plans for lineage {}", plan.lineage)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reverie_core::RefusalReason;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn spiral(secs: i64) -> Observation {
        Observation::new(Category::Aesthetic, ["spiral"], 0.8).at(t0() + Duration::seconds(secs))
    }

    #[test]
    fn clock_is_logical() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        assert_eq!(engine.clock(), None);
        engine.admit(spiral(10)).unwrap();
        engine.admit(spiral(5)).unwrap();
        assert_eq!(engine.clock(), Some(t0() + Duration::seconds(10)));
        engine.tick(t0());
        assert_eq!(engine.clock(), Some(t0() + Duration::seconds(10)));
    }

    #[test]
    fn admission_drives_synthesis_and_planning() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        engine.admit(spiral(0)).unwrap();
        let outcome = engine.admit(spiral(10)).unwrap();
        assert_eq!(outcome.cycle.patterns.appeared.len(), 1);
        assert_eq!(outcome.cycle.intuitions.len(), 1);
        assert!(outcome.cycle.plans[0].created);
        assert_eq!(engine.open_plans().len(), 1);
        assert_eq!(engine.status().counters.plans_created, 1);
    }

    #[test]
    fn refusal_leaves_clock_and_window_alone() {
        let mut engine = EngineHandle::new(EngineConfig::default().with_initial_balance(0.0));
        let err = engine.admit(spiral(0)).unwrap_err();
        assert!(matches!(err.reason, RefusalReason::InsufficientEnergy { .. }));
        assert_eq!(engine.clock(), None);
        assert_eq!(engine.window_len(), 0);
        assert_eq!(engine.health(), Health::ResourceStarved);
        assert_eq!(engine.status().counters.refused_energy, 1);
    }

    #[test]
    fn tick_replenishes_passively() {
        let mut config = EngineConfig::default().with_initial_balance(0.5);
        config.ledger.replenish_per_minute = 2.0;
        let mut engine = EngineHandle::new(config);
        engine.tick(t0());
        let report = engine.tick(t0() + Duration::minutes(3));
        assert!((report.replenished - 6.0).abs() < 1e-9);
        assert!((engine.balance() - 6.5).abs() < 1e-9);
        assert_eq!(engine.health(), Health::Healthy);
    }

    #[test]
    fn tick_evicts_and_removes_patterns() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        engine.admit(spiral(0)).unwrap();
        engine.admit(spiral(10)).unwrap();
        assert_eq!(engine.patterns().len(), 1);

        let report = engine.tick(t0() + Duration::hours(1));
        assert_eq!(report.evicted.len(), 2);
        assert_eq!(report.patterns.removed.len(), 1);
        assert!(engine.patterns().is_empty());
    }

    #[test]
    fn export_and_restore_preserve_state() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        for i in 0..3 {
            engine.admit(spiral(i * 10)).unwrap();
        }
        let plan_id = engine.open_plans()[0].id;
        engine.mark_step_complete(plan_id, 0).unwrap();

        let state = engine.export_state();
        let restored = EngineHandle::from_state(EngineConfig::default(), state.clone()).unwrap();
        assert_eq!(restored.balance(), engine.balance());
        assert_eq!(restored.patterns(), engine.patterns());
        assert_eq!(restored.observations(), engine.observations());
        let plan = restored.plan(plan_id).unwrap();
        assert_eq!(plan.status, PlanStatus::Suspended);
        assert!(plan.steps[0].completed);
    }

    #[test]
    fn restore_rejects_corrupt_state() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        engine.admit(spiral(0)).unwrap();
        engine.admit(spiral(10)).unwrap();

        let mut negative = engine.export_state();
        negative.ledger.balance = -1.0;
        assert!(matches!(
            EngineHandle::from_state(EngineConfig::default(), negative),
            Err(PersistenceError::Corrupt(_))
        ));

        let mut orphaned = engine.export_state();
        orphaned.observations.truncate(1);
        assert!(EngineHandle::from_state(EngineConfig::default(), orphaned).is_err());

        let mut cyclic = engine.export_state();
        cyclic.plans[0].plan.steps[0].dependencies.insert(2);
        assert!(EngineHandle::from_state(EngineConfig::default(), cyclic).is_err());
    }

    #[test]
    fn restore_past_horizon_rematches() {
        let mut engine = EngineHandle::new(EngineConfig::default());
        engine.admit(spiral(0)).unwrap();
        engine.admit(spiral(10)).unwrap();
        let mut state = engine.export_state();
        state.clock = Some(t0() + Duration::hours(2));

        let restored = EngineHandle::from_state(EngineConfig::default(), state).unwrap();
        assert_eq!(restored.window_len(), 0);
        assert!(restored.patterns().is_empty());
        assert_eq!(restored.open_plans().len(), 1);
    }
}
