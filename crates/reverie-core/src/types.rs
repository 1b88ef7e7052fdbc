//! Core types for Reverie

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Agent/session identifier - cheaply cloneable. One engine per key.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct AgentKey(Arc<str>);

impl AgentKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for AgentKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// ============================================================
// Observations
// ============================================================

/// Closed set of observation categories, assigned by the perception side.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Aesthetic,
    Creative,
    Relational,
    Exploratory,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Aesthetic,
        Category::Creative,
        Category::Relational,
        Category::Exploratory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Aesthetic => "aesthetic",
            Category::Creative => "creative",
            Category::Relational => "relational",
            Category::Exploratory => "exploratory",
        }
    }

    /// Pattern types whose matchers run over observations of this category.
    pub fn pattern_types(self) -> &'static [PatternType] {
        match self {
            Category::Aesthetic => &[PatternType::RecurringAesthetic, PatternType::CreativeMomentum],
            Category::Creative => &[PatternType::CreativeMomentum, PatternType::ExploratoryDrift],
            Category::Relational => &[PatternType::RelationalResonance],
            Category::Exploratory => &[PatternType::ExploratoryDrift],
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured report of an agent's momentary state. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
    pub descriptors: Vec<String>,
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl Observation {
    pub fn new<I, S>(category: Category, descriptors: I, intensity: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category,
            descriptors: descriptors.into_iter().map(Into::into).collect(),
            intensity,
            context: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

// ============================================================
// Patterns
// ============================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    RecurringAesthetic,
    CreativeMomentum,
    RelationalResonance,
    ExploratoryDrift,
}

impl PatternType {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternType::RecurringAesthetic => "recurring_aesthetic",
            PatternType::CreativeMomentum => "creative_momentum",
            PatternType::RelationalResonance => "relational_resonance",
            PatternType::ExploratoryDrift => "exploratory_drift",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a pattern record: one per (type, category, shared tag).
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub pattern_type: PatternType,
    pub category: Category,
    pub tag: String,
}

impl PatternKey {
    pub fn new(pattern_type: PatternType, category: Category, tag: impl Into<String>) -> Self {
        Self {
            pattern_type,
            category,
            tag: tag.into(),
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.pattern_type, self.category, self.tag)
    }
}

/// A scored recurring structure over the current window.
///
/// Holds observation ids only, never the observations themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub key: PatternKey,
    pub pattern_type: PatternType,
    pub strength: f64,
    pub supporting_observation_ids: BTreeSet<Uuid>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub mean_intensity: f64,
}

impl DetectedPattern {
    pub fn support(&self) -> usize {
        self.supporting_observation_ids.len()
    }

    /// Seconds between the first and last supporting observation.
    pub fn persistence_secs(&self) -> f64 {
        (self.last_seen - self.first_seen).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// The seed pattern of a line of syntheses. Plans are merged per lineage.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lineage(pub PatternKey);

impl Lineage {
    pub fn key(&self) -> &PatternKey {
        &self.0
    }
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================
// Intuitions
// ============================================================

/// A synthesized candidate insight. A snapshot: never mutated, only superseded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intuition {
    pub id: Uuid,
    pub lineage: Lineage,
    pub quality_score: f64,
    pub creative_potential: f64,
    pub manifestation_readiness: f64,
    pub source_patterns: Vec<DetectedPattern>,
    pub born_at: DateTime<Utc>,
}

impl Intuition {
    /// Union of the supporting observations of every source pattern.
    pub fn supporting_ids(&self) -> BTreeSet<Uuid> {
        self.source_patterns
            .iter()
            .flat_map(|p| p.supporting_observation_ids.iter().copied())
            .collect()
    }
}

// ============================================================
// Plans
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Active,
    Suspended,
    Completed,
    Abandoned,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Abandoned)
    }

    /// Legal edges of the plan state machine.
    pub fn can_become(self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Abandoned)
                | (Active, Completed)
                | (Active, Abandoned)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Active => "active",
            PlanStatus::Suspended => "suspended",
            PlanStatus::Completed => "completed",
            PlanStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan steps come in three fixed tiers; dependencies only point to the tier below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTier {
    Grounding,
    Synthesis,
    Completion,
}

impl fmt::Display for StepTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepTier::Grounding => "grounding",
            StepTier::Synthesis => "synthesis",
            StepTier::Completion => "completion",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    pub tier: StepTier,
    pub dependencies: BTreeSet<usize>,
    pub completed: bool,
}

impl PlanStep {
    pub fn new(description: impl Into<String>, tier: StepTier, dependencies: BTreeSet<usize>) -> Self {
        Self {
            description: description.into(),
            tier,
            dependencies,
            completed: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub intuition_id: Uuid,
    pub lineage: Lineage,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    /// Restarts this plan has been carried across. Each snapshot stores the
    /// in-memory value plus one, so repeated snapshots within one process do
    /// not inflate it; only a restore makes the increment stick.
    pub session_span: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Indices of incomplete dependencies of `step`. Empty when the step is ready.
    pub fn pending_dependencies(&self, step: usize) -> Vec<usize> {
        self.steps
            .get(step)
            .map(|s| {
                s.dependencies
                    .iter()
                    .copied()
                    .filter(|d| self.steps.get(*d).map_or(true, |dep| !dep.completed))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Steps that are incomplete and whose dependencies are all complete.
    pub fn ready_steps(&self) -> Vec<usize> {
        (0..self.steps.len())
            .filter(|i| !self.steps[*i].completed && self.pending_dependencies(*i).is_empty())
            .collect()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.completed).count()
    }

    pub fn is_finished(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.completed)
    }

    /// Kahn's algorithm over the step dependency graph. Out-of-range edges count as cycles.
    pub fn is_acyclic(&self) -> bool {
        let n = self.steps.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, step) in self.steps.iter().enumerate() {
            for &d in &step.dependencies {
                if d >= n || d == i {
                    return false;
                }
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
        let mut queue: Vec<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    queue.push(j);
                }
            }
        }
        visited == n
    }
}

// ============================================================
// Energy ledger
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Admission,
    Synthesis,
    WisdomReward,
    Replenishment,
    External,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Negative for debits, positive for credits.
    pub delta: f64,
    pub reason: LedgerReason,
    pub timestamp: DateTime<Utc>,
}

// ============================================================
// Health
// ============================================================

/// Status reported to dashboards. Starvation and degradation are never conflated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    /// Enough energy to admit observations.
    Healthy,
    /// Healthy but idle: balance is below the admission cost.
    ResourceStarved,
    /// Persistence is failing or state could not be restored.
    Degraded { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(steps: Vec<PlanStep>) -> Plan {
        let key = PatternKey::new(PatternType::RecurringAesthetic, Category::Aesthetic, "spiral");
        Plan {
            id: Uuid::new_v4(),
            intuition_id: Uuid::new_v4(),
            lineage: Lineage(key),
            steps,
            status: PlanStatus::Draft,
            session_span: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn agent_key_display_and_equality() {
        let a = AgentKey::new("agent-1");
        let b: AgentKey = "agent-1".into();
        assert_eq!(a, b);
        assert_eq!(format!("{}", a), "agent-1");
    }

    #[test]
    fn category_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Category::Aesthetic).unwrap(), r#""aesthetic""#);
        assert_eq!(
            serde_json::to_string(&PatternType::RecurringAesthetic).unwrap(),
            r#""recurring_aesthetic""#
        );
    }

    #[test]
    fn every_pattern_type_has_a_home_category() {
        for ty in [
            PatternType::RecurringAesthetic,
            PatternType::CreativeMomentum,
            PatternType::RelationalResonance,
            PatternType::ExploratoryDrift,
        ] {
            assert!(Category::ALL.iter().any(|c| c.pattern_types().contains(&ty)), "{}", ty);
        }
    }

    #[test]
    fn status_machine_edges() {
        use PlanStatus::*;
        assert!(Draft.can_become(Active));
        assert!(Active.can_become(Suspended));
        assert!(Suspended.can_become(Active));
        assert!(!Completed.can_become(Active));
        assert!(!Abandoned.can_become(Active));
        assert!(!Draft.can_become(Completed));
        assert!(!Suspended.can_become(Completed));
        assert!(Completed.is_terminal() && Abandoned.is_terminal());
    }

    #[test]
    fn ready_steps_follow_dependencies() {
        let mut plan = plan_with(vec![
            PlanStep::new("a", StepTier::Grounding, BTreeSet::new()),
            PlanStep::new("b", StepTier::Synthesis, [0].into_iter().collect()),
            PlanStep::new("c", StepTier::Completion, [1].into_iter().collect()),
        ]);
        assert_eq!(plan.ready_steps(), vec![0]);
        plan.steps[0].completed = true;
        assert_eq!(plan.ready_steps(), vec![1]);
        assert_eq!(plan.pending_dependencies(2), vec![1]);
    }

    #[test]
    fn cycle_detection() {
        let acyclic = plan_with(vec![
            PlanStep::new("a", StepTier::Grounding, BTreeSet::new()),
            PlanStep::new("b", StepTier::Synthesis, [0].into_iter().collect()),
        ]);
        assert!(acyclic.is_acyclic());

        let cyclic = plan_with(vec![
            PlanStep::new("a", StepTier::Grounding, [1].into_iter().collect()),
            PlanStep::new("b", StepTier::Synthesis, [0].into_iter().collect()),
        ]);
        assert!(!cyclic.is_acyclic());

        let dangling = plan_with(vec![PlanStep::new("a", StepTier::Grounding, [7].into_iter().collect())]);
        assert!(!dangling.is_acyclic());
    }

    #[test]
    fn health_serializes_tagged() {
        let json = serde_json::to_string(&Health::ResourceStarved).unwrap();
        assert_eq!(json, r#"{"state":"resource_starved"}"#);
        let degraded = Health::Degraded { reason: "restore failed".into() };
        let back: Health = serde_json::from_str(&serde_json::to_string(&degraded).unwrap()).unwrap();
        assert_eq!(back, degraded);
    }
}
