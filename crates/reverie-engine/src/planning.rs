//! PlanningBuffer: turns intuitions into dependency-ordered plans
//!
//! Each plan has three tiers: grounding steps (one per contributing pattern),
//! synthesis passes that depend on every grounding step, and a completion step
//! that depends on every synthesis pass. Intuitions of a lineage that already
//! has an open plan are merged into it instead of opening a second one.

use crate::config::PlanningConfig;
use chrono::{DateTime, Utc};
use reverie_core::{time, DetectedPattern, Intuition, InvalidTransition, Lineage, Plan, PlanStatus, PlanStep, StepTier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

/// Archived plans kept in memory.
const ARCHIVE_LIMIT: usize = 256;

/// An open plan and the intuition it currently answers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub plan: Plan,
    pub intuition: Intuition,
}

/// Result of accepting an intuition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanUpdate {
    pub plan_id: Uuid,
    pub lineage: Lineage,
    /// True when a new plan was opened, false when merged into an open one.
    pub created: bool,
    pub steps_added: usize,
}

/// A step ready to be worked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub plan_id: Uuid,
    pub lineage: Lineage,
    pub step: usize,
    pub tier: StepTier,
    pub description: String,
}

#[derive(Debug)]
pub struct PlanningBuffer {
    config: PlanningConfig,
    /// Non-terminal plans, in creation order.
    open: Vec<PlanEntry>,
    archive: VecDeque<Plan>,
}

impl PlanningBuffer {
    pub fn new(config: PlanningConfig) -> Self {
        Self { config, open: Vec::new(), archive: VecDeque::new() }
    }

    /// Rebuild from persisted entries. Plans that were active come back suspended.
    pub fn restore(config: PlanningConfig, entries: Vec<PlanEntry>) -> Self {
        let mut buffer = Self::new(config);
        for mut entry in entries {
            if entry.plan.status == PlanStatus::Active {
                entry.plan.status = PlanStatus::Suspended;
            }
            if entry.plan.status.is_terminal() {
                buffer.archive_plan(entry.plan);
            } else {
                buffer.open.push(entry);
            }
        }
        buffer
    }

    /// Number of synthesis passes for an intuition.
    pub fn synthesis_passes(&self, intuition: &Intuition) -> usize {
        let complexity = intuition.quality_score * intuition.creative_potential;
        if complexity > self.config.complex_threshold {
            3
        } else if complexity > self.config.moderate_threshold {
            2
        } else {
            1
        }
    }

    /// Open a plan for the intuition's lineage or merge into the open one.
    pub fn accept(&mut self, intuition: Intuition, now: DateTime<Utc>) -> PlanUpdate {
        let passes = self.synthesis_passes(&intuition);
        let lineage = intuition.lineage.clone();

        if let Some(entry) = self.open.iter_mut().find(|e| e.plan.lineage == lineage) {
            let steps_added = graft(&mut entry.plan, &intuition, passes);
            entry.plan.intuition_id = intuition.id;
            entry.plan.updated_at = now;
            entry.intuition = intuition;
            info!(
                "Merged intuition into plan {} ({}): +{} steps, {} total",
                entry.plan.id,
                lineage,
                steps_added,
                entry.plan.steps.len()
            );
            return PlanUpdate { plan_id: entry.plan.id, lineage, created: false, steps_added };
        }

        let mut plan = Plan {
            id: Uuid::new_v4(),
            intuition_id: intuition.id,
            lineage: lineage.clone(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            session_span: 0,
            created_at: now,
            updated_at: now,
        };
        let steps_added = graft(&mut plan, &intuition, passes);
        info!("Created plan {} for {} with {} steps", plan.id, lineage, steps_added);
        let plan_id = plan.id;
        self.open.push(PlanEntry { plan, intuition });
        PlanUpdate { plan_id, lineage, created: true, steps_added }
    }

    // ============================================================
    // Step and status transitions
    // ============================================================

    /// Start work on a ready step. Draft and suspended plans become active.
    pub fn begin_step(&mut self, plan_id: Uuid, step: usize, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let entry = self.open_entry(plan_id)?;
        check_ready(&entry.plan, step)?;
        activate(&mut entry.plan)?;
        entry.plan.updated_at = now;
        Ok(())
    }

    /// Mark a ready step complete. Returns the plan status afterwards; a plan
    /// whose steps are all complete is completed and archived.
    pub fn mark_step_complete(
        &mut self,
        plan_id: Uuid,
        step: usize,
        now: DateTime<Utc>,
    ) -> Result<PlanStatus, InvalidTransition> {
        let entry = self.open_entry(plan_id)?;
        check_ready(&entry.plan, step)?;
        activate(&mut entry.plan)?;
        entry.plan.steps[step].completed = true;
        entry.plan.updated_at = now;
        debug!("Plan {} step {} complete ({}/{})", plan_id, step, entry.plan.completed_steps(), entry.plan.steps.len());

        if entry.plan.is_finished() {
            entry.plan.status = PlanStatus::Completed;
            info!("Plan {} ({}) completed", plan_id, entry.plan.lineage);
            self.close(plan_id);
            return Ok(PlanStatus::Completed);
        }
        Ok(entry.plan.status)
    }

    pub fn suspend_plan(&mut self, plan_id: Uuid, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.change_status(plan_id, PlanStatus::Suspended, now)
    }

    pub fn resume_plan(&mut self, plan_id: Uuid, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.change_status(plan_id, PlanStatus::Active, now)
    }

    pub fn abandon_plan(&mut self, plan_id: Uuid, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.change_status(plan_id, PlanStatus::Abandoned, now)?;
        info!("Plan {} abandoned", plan_id);
        self.close(plan_id);
        Ok(())
    }

    /// Suspend active plans nobody has touched for `idle_suspend_secs`.
    pub fn suspend_idle(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        if self.config.idle_suspend_secs == 0 {
            return Vec::new();
        }
        let idle = time::interval(self.config.idle_suspend_secs);
        let mut suspended = Vec::new();
        for entry in self.open.iter_mut() {
            let plan = &mut entry.plan;
            if plan.status == PlanStatus::Active && time::saturating_add(plan.updated_at, idle) < now {
                plan.status = PlanStatus::Suspended;
                plan.updated_at = now;
                suspended.push(plan.id);
            }
        }
        if !suspended.is_empty() {
            info!("Suspended {} idle plan(s)", suspended.len());
        }
        suspended
    }

    // ============================================================
    // Queries
    // ============================================================

    pub fn get(&self, plan_id: Uuid) -> Option<&Plan> {
        self.open
            .iter()
            .map(|e| &e.plan)
            .chain(self.archive.iter())
            .find(|p| p.id == plan_id)
    }

    pub fn intuition_for(&self, plan_id: Uuid) -> Option<&Intuition> {
        self.open.iter().find(|e| e.plan.id == plan_id).map(|e| &e.intuition)
    }

    /// Draft and active plans.
    pub fn executable_plans(&self) -> Vec<Plan> {
        self.open
            .iter()
            .filter(|e| matches!(e.plan.status, PlanStatus::Draft | PlanStatus::Active))
            .map(|e| e.plan.clone())
            .collect()
    }

    /// Every non-terminal plan.
    pub fn open_plans(&self) -> Vec<Plan> {
        self.open.iter().map(|e| e.plan.clone()).collect()
    }

    pub fn archived_plans(&self) -> Vec<Plan> {
        self.archive.iter().cloned().collect()
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.open
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Ready steps across executable plans, grounding tier first, oldest plan first.
    pub fn next_actions(&self, max: usize) -> Vec<NextAction> {
        let mut actions: Vec<(DateTime<Utc>, NextAction)> = self
            .open
            .iter()
            .filter(|e| matches!(e.plan.status, PlanStatus::Draft | PlanStatus::Active))
            .flat_map(|e| {
                let plan = &e.plan;
                plan.ready_steps().into_iter().map(move |i| {
                    let step = &plan.steps[i];
                    let action = NextAction {
                        plan_id: plan.id,
                        lineage: plan.lineage.clone(),
                        step: i,
                        tier: step.tier,
                        description: step.description.clone(),
                    };
                    (plan.created_at, action)
                })
            })
            .collect();
        actions.sort_by(|(ca, a), (cb, b)| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| ca.cmp(cb))
                .then_with(|| a.plan_id.cmp(&b.plan_id))
                .then_with(|| a.step.cmp(&b.step))
        });
        actions.into_iter().take(max).map(|(_, a)| a).collect()
    }

    // ============================================================
    // Internals
    // ============================================================

    fn open_entry(&mut self, plan_id: Uuid) -> Result<&mut PlanEntry, InvalidTransition> {
        if let Some(archived) = self.archive.iter().find(|p| p.id == plan_id) {
            return Err(InvalidTransition::Terminal { plan_id, status: archived.status });
        }
        self.open
            .iter_mut()
            .find(|e| e.plan.id == plan_id)
            .ok_or(InvalidTransition::PlanNotFound(plan_id))
    }

    fn change_status(&mut self, plan_id: Uuid, to: PlanStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let entry = self.open_entry(plan_id)?;
        let from = entry.plan.status;
        if !from.can_become(to) {
            return Err(InvalidTransition::IllegalStatusChange { plan_id, from, to });
        }
        entry.plan.status = to;
        entry.plan.updated_at = now;
        debug!("Plan {}: {} -> {}", plan_id, from, to);
        Ok(())
    }

    fn close(&mut self, plan_id: Uuid) {
        if let Some(pos) = self.open.iter().position(|e| e.plan.id == plan_id) {
            let entry = self.open.remove(pos);
            self.archive_plan(entry.plan);
        }
    }

    fn archive_plan(&mut self, plan: Plan) {
        if self.archive.len() == ARCHIVE_LIMIT {
            self.archive.pop_front();
        }
        self.archive.push_back(plan);
    }
}

fn grounding_description(pattern: &DetectedPattern) -> String {
    format!("ground {} in {}:{}", pattern.pattern_type, pattern.key.category, pattern.key.tag)
}

/// Append the intuition's steps that the plan lacks and wire new dependencies
/// into incomplete steps of the tier above. Returns how many steps were added.
fn graft(plan: &mut Plan, intuition: &Intuition, passes: usize) -> usize {
    let before = plan.steps.len();
    let mut known: BTreeSet<String> = plan.steps.iter().map(|s| s.description.clone()).collect();
    let lineage = &intuition.lineage;

    let mut new_grounding = BTreeSet::new();
    for pattern in &intuition.source_patterns {
        let description = grounding_description(pattern);
        if known.insert(description.clone()) {
            new_grounding.insert(plan.steps.len());
            plan.steps.push(PlanStep::new(description, StepTier::Grounding, BTreeSet::new()));
        }
    }
    let grounding = tier_indices(plan, StepTier::Grounding);

    for step in plan.steps.iter_mut().filter(|s| s.tier == StepTier::Synthesis && !s.completed) {
        step.dependencies.extend(new_grounding.iter().copied());
    }
    let mut new_synthesis = BTreeSet::new();
    for pass in 1..=passes {
        let description = format!("synthesize {} lineage, pass {}", lineage, pass);
        if known.insert(description.clone()) {
            new_synthesis.insert(plan.steps.len());
            plan.steps.push(PlanStep::new(description, StepTier::Synthesis, grounding.clone()));
        }
    }
    let synthesis = tier_indices(plan, StepTier::Synthesis);

    for step in plan.steps.iter_mut().filter(|s| s.tier == StepTier::Completion && !s.completed) {
        step.dependencies.extend(new_synthesis.iter().copied());
    }
    let description = format!("manifest {} lineage", lineage);
    if known.insert(description.clone()) {
        plan.steps.push(PlanStep::new(description, StepTier::Completion, synthesis));
    }

    plan.steps.len() - before
}

fn tier_indices(plan: &Plan, tier: StepTier) -> BTreeSet<usize> {
    plan.steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.tier == tier)
        .map(|(i, _)| i)
        .collect()
}

fn check_ready(plan: &Plan, step: usize) -> Result<(), InvalidTransition> {
    let plan_id = plan.id;
    let Some(target) = plan.steps.get(step) else {
        return Err(InvalidTransition::StepOutOfRange { plan_id, step, len: plan.steps.len() });
    };
    if target.completed {
        return Err(InvalidTransition::StepAlreadyComplete { plan_id, step });
    }
    let pending = plan.pending_dependencies(step);
    if !pending.is_empty() {
        return Err(InvalidTransition::DependenciesIncomplete { plan_id, step, tier: target.tier, pending });
    }
    Ok(())
}

/// Draft or suspended plans move to active when work happens on them.
fn activate(plan: &mut Plan) -> Result<(), InvalidTransition> {
    match plan.status {
        PlanStatus::Active => Ok(()),
        PlanStatus::Draft | PlanStatus::Suspended => {
            plan.status = PlanStatus::Active;
            Ok(())
        }
        status => Err(InvalidTransition::Terminal { plan_id: plan.id, status }),
    }
}
