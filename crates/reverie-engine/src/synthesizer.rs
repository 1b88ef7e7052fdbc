//! IntuitionSynthesizer: combines strong patterns into intuitions
//!
//! Every pattern at or above the synthesis threshold seeds a candidate and names
//! its lineage. Companions of other pattern types that overlap the seed in time
//! join it. Each synthesis is paid for through the ledger; a refusal parks the
//! lineage in a FIFO retry queue that is drained first on the next cycle.

use crate::config::SynthesisConfig;
use crate::detector::PatternDetector;
use crate::ledger::ResourceLedger;
use chrono::{DateTime, Duration, Utc};
use reverie_core::{time, DetectedPattern, Intuition, LedgerReason, Lineage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Base multiplier of creative potential.
const POTENTIAL_BASE: f64 = 0.7;
/// Added per distinct pattern type among the contributors.
const POTENTIAL_PER_TYPE: f64 = 0.1;

/// A lineage whose synthesis was refused for lack of energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSynthesis {
    pub lineage: Lineage,
    /// Refusals so far.
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

/// A lineage given up on (retries exhausted or cancelled). It stays quiet until
/// its seed gains support outside `support`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledLineage {
    pub lineage: Lineage,
    pub support: BTreeSet<Uuid>,
}

/// What one synthesis pass did.
#[derive(Debug, Clone, Default)]
pub struct SynthesisOutcome {
    pub intuitions: Vec<Intuition>,
    pub queued: Vec<Lineage>,
    pub cancelled: Vec<Lineage>,
    pub dropped: Vec<Lineage>,
}

/// Persisted part of the synthesizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisState {
    #[serde(default)]
    pub recent: Vec<Intuition>,
    #[serde(default)]
    pub pending: Vec<PendingSynthesis>,
    #[serde(default)]
    pub settled: Vec<SettledLineage>,
}

enum Attempt {
    Synthesized(Intuition),
    Refused,
    AlreadyCovered,
}

#[derive(Debug)]
pub struct IntuitionSynthesizer {
    config: SynthesisConfig,
    locality: Duration,
    /// Unexpired intuitions, oldest first. Used for lineage dedup.
    recent: Vec<Intuition>,
    pending: VecDeque<PendingSynthesis>,
    settled: Vec<SettledLineage>,
    synthesized_total: u64,
}

impl IntuitionSynthesizer {
    pub fn new(config: SynthesisConfig, locality_secs: u64) -> Self {
        Self {
            config,
            locality: time::interval(locality_secs),
            recent: Vec::new(),
            pending: VecDeque::new(),
            settled: Vec::new(),
            synthesized_total: 0,
        }
    }

    pub fn restore(config: SynthesisConfig, locality_secs: u64, state: SynthesisState) -> Self {
        let mut synthesizer = Self::new(config, locality_secs);
        synthesizer.recent = state.recent;
        synthesizer.pending = state.pending.into();
        synthesizer.settled = state.settled;
        synthesizer
    }

    pub fn state(&self) -> SynthesisState {
        SynthesisState {
            recent: self.recent.clone(),
            pending: self.pending.iter().cloned().collect(),
            settled: self.settled.clone(),
        }
    }

    /// One pass: expire, retry the queue, then try fresh seeds strongest first.
    pub fn run(
        &mut self,
        detector: &PatternDetector,
        ledger: &mut ResourceLedger,
        now: DateTime<Utc>,
    ) -> SynthesisOutcome {
        let mut outcome = SynthesisOutcome::default();
        self.expire(now);
        self.settled.retain(|s| detector.get(s.lineage.key()).is_some());

        let mut handled: BTreeSet<Lineage> = BTreeSet::new();
        let queue = std::mem::take(&mut self.pending);
        for mut entry in queue {
            handled.insert(entry.lineage.clone());
            let seed = match detector.get(entry.lineage.key()) {
                Some(seed) if seed.strength >= self.config.threshold => seed,
                _ => {
                    debug!("Cancelling queued synthesis for {}: seed below threshold", entry.lineage);
                    outcome.cancelled.push(entry.lineage);
                    continue;
                }
            };
            match self.attempt(seed, detector, ledger, now) {
                Attempt::Synthesized(intuition) => outcome.intuitions.push(intuition),
                Attempt::AlreadyCovered => outcome.cancelled.push(entry.lineage),
                Attempt::Refused => {
                    entry.attempts += 1;
                    if entry.attempts > self.config.max_retries {
                        warn!(
                            "Dropping synthesis for {} after {} refusals (balance {:.2})",
                            entry.lineage,
                            entry.attempts,
                            ledger.balance()
                        );
                        self.settle(entry.lineage.clone(), seed);
                        outcome.dropped.push(entry.lineage);
                    } else {
                        self.pending.push_back(entry);
                    }
                }
            }
        }

        let mut seeds: Vec<&DetectedPattern> = detector
            .iter()
            .filter(|p| p.strength >= self.config.threshold)
            .collect();
        seeds.sort_by(|a, b| b.strength.total_cmp(&a.strength).then_with(|| a.key.cmp(&b.key)));

        for seed in seeds {
            let lineage = Lineage(seed.key.clone());
            if handled.contains(&lineage) || self.is_settled(&lineage, seed) {
                continue;
            }
            match self.attempt(seed, detector, ledger, now) {
                Attempt::Synthesized(intuition) => outcome.intuitions.push(intuition),
                Attempt::AlreadyCovered => {}
                Attempt::Refused => {
                    debug!("Synthesis for {} refused, queued for retry", lineage);
                    self.pending.push_back(PendingSynthesis { lineage: lineage.clone(), attempts: 1, queued_at: now });
                    outcome.queued.push(lineage);
                }
            }
        }
        outcome
    }

    /// Remove a queued lineage and keep it from re-queueing until its seed
    /// gains new support. Returns whether it was queued.
    pub fn cancel_pending(&mut self, lineage: &Lineage, detector: &PatternDetector) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| &p.lineage != lineage);
        let removed = before != self.pending.len();
        if removed {
            if let Some(seed) = detector.get(lineage.key()) {
                self.settle(lineage.clone(), seed);
            }
        }
        removed
    }

    fn settle(&mut self, lineage: Lineage, seed: &DetectedPattern) {
        self.settled.retain(|s| s.lineage != lineage);
        self.settled.push(SettledLineage { lineage, support: seed.supporting_observation_ids.clone() });
    }

    /// Settled lineages wake up once the seed has support they have not seen.
    fn is_settled(&mut self, lineage: &Lineage, seed: &DetectedPattern) -> bool {
        let Some(pos) = self.settled.iter().position(|s| &s.lineage == lineage) else {
            return false;
        };
        if seed.supporting_observation_ids.is_subset(&self.settled[pos].support) {
            return true;
        }
        self.settled.remove(pos);
        false
    }

    pub fn pending(&self) -> Vec<PendingSynthesis> {
        self.pending.iter().cloned().collect()
    }

    pub fn recent(&self) -> &[Intuition] {
        &self.recent
    }

    pub fn synthesized_total(&self) -> u64 {
        self.synthesized_total
    }

    /// Contributors for `seed`: the seed plus up to `max_companions` overlapping
    /// patterns of other types, weakest dropped first while quality is short.
    pub fn contributors(&self, seed: &DetectedPattern, detector: &PatternDetector) -> Vec<DetectedPattern> {
        let lo = time::saturating_sub(seed.first_seen, self.locality);
        let hi = time::saturating_add(seed.last_seen, self.locality);

        let mut companions: Vec<&DetectedPattern> = detector
            .iter()
            .filter(|p| {
                p.pattern_type != seed.pattern_type
                    && p.strength >= self.config.companion_floor
                    && p.first_seen <= hi
                    && p.last_seen >= lo
            })
            .collect();
        companions.sort_by(|a, b| b.strength.total_cmp(&a.strength).then_with(|| a.key.cmp(&b.key)));

        let mut types = BTreeSet::from([seed.pattern_type]);
        let mut contributors = vec![seed.clone()];
        for companion in companions {
            if contributors.len() > self.config.max_companions {
                break;
            }
            if types.insert(companion.pattern_type) {
                contributors.push(companion.clone());
            }
        }
        while contributors.len() > 1 && quality(&contributors) < self.config.threshold {
            contributors.pop();
        }
        contributors
    }

    fn attempt(
        &mut self,
        seed: &DetectedPattern,
        detector: &PatternDetector,
        ledger: &mut ResourceLedger,
        now: DateTime<Utc>,
    ) -> Attempt {
        let lineage = Lineage(seed.key.clone());
        let contributors = self.contributors(seed, detector);
        let support: BTreeSet<Uuid> = contributors
            .iter()
            .flat_map(|p| p.supporting_observation_ids.iter().copied())
            .collect();

        let covered = self
            .recent
            .iter()
            .any(|i| i.lineage == lineage && !i.supporting_ids().is_disjoint(&support));
        if covered {
            return Attempt::AlreadyCovered;
        }

        if !ledger.authorize(self.config.synthesis_cost, LedgerReason::Synthesis, now) {
            return Attempt::Refused;
        }

        let intuition = self.score(lineage, contributors, now);
        ledger.credit(
            self.config.wisdom_reward_factor * intuition.quality_score,
            LedgerReason::WisdomReward,
            now,
        );
        info!(
            "Synthesized intuition {} for {} (quality {:.3}, potential {:.3}, readiness {:.3}, {} patterns)",
            intuition.id,
            intuition.lineage,
            intuition.quality_score,
            intuition.creative_potential,
            intuition.manifestation_readiness,
            intuition.source_patterns.len()
        );
        self.recent.push(intuition.clone());
        self.synthesized_total += 1;
        Attempt::Synthesized(intuition)
    }

    fn score(&self, lineage: Lineage, contributors: Vec<DetectedPattern>, now: DateTime<Utc>) -> Intuition {
        let quality_score = quality(&contributors);
        let distinct = contributors.iter().map(|p| p.pattern_type).collect::<BTreeSet<_>>().len();
        let creative_potential = (quality_score * (POTENTIAL_BASE + POTENTIAL_PER_TYPE * distinct as f64)).min(1.0);
        let persistence = contributors.iter().map(|p| p.persistence_secs()).fold(0.0, f64::max);
        let settled = 1.0 - (-persistence / self.config.persistence_tau_secs).exp();
        let manifestation_readiness = creative_potential * (0.5 + 0.5 * settled);

        Intuition {
            id: Uuid::new_v4(),
            lineage,
            quality_score,
            creative_potential,
            manifestation_readiness,
            source_patterns: contributors,
            born_at: now,
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let ttl = time::interval(self.config.intuition_ttl_secs);
        self.recent.retain(|i| time::saturating_add(i.born_at, ttl) > now);
    }
}

/// Strength-weighted mean strength.
fn quality(patterns: &[DetectedPattern]) -> f64 {
    let total: f64 = patterns.iter().map(|p| p.strength).sum();
    if total <= 0.0 {
        return 0.0;
    }
    patterns.iter().map(|p| p.strength * p.strength).sum::<f64>() / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use reverie_core::{Category, PatternKey, PatternType};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn pattern(ty: PatternType, cat: Category, tag: &str, strength: f64, span_secs: i64) -> DetectedPattern {
        DetectedPattern {
            key: PatternKey::new(ty, cat, tag),
            pattern_type: ty,
            strength,
            supporting_observation_ids: [Uuid::new_v4(), Uuid::new_v4()].into_iter().collect(),
            first_seen: t0(),
            last_seen: t0() + Duration::seconds(span_secs),
            mean_intensity: strength,
        }
    }

    fn detector_with(patterns: Vec<DetectedPattern>) -> PatternDetector {
        PatternDetector::restore(DetectorConfig::default(), patterns)
    }

    fn synthesizer() -> IntuitionSynthesizer {
        IntuitionSynthesizer::new(SynthesisConfig::default(), 120)
    }

    #[test]
    fn quality_is_strength_weighted() {
        let ps = vec![
            pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.9, 0),
            pattern(PatternType::CreativeMomentum, Category::Aesthetic, "a", 0.3, 0),
        ];
        let q = quality(&ps);
        assert!((q - (0.81 + 0.09) / 1.2).abs() < 1e-12);
        assert!(quality(&[]) == 0.0);
    }

    #[test]
    fn below_threshold_does_nothing() {
        let detector = detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.6, 0)]);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let outcome = synthesizer().run(&detector, &mut ledger, t0());
        assert!(outcome.intuitions.is_empty());
        assert_eq!(ledger.balance(), 100.0);
    }

    #[test]
    fn synthesis_charges_cost_and_rewards_quality() {
        let detector = detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 60)]);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let outcome = synthesizer().run(&detector, &mut ledger, t0());
        assert_eq!(outcome.intuitions.len(), 1);
        let i = &outcome.intuitions[0];
        assert!((i.quality_score - 0.8).abs() < 1e-12);
        assert!((ledger.balance() - (100.0 - 25.0 + 25.0 * 0.8)).abs() < 1e-9);
        assert!(i.manifestation_readiness <= i.creative_potential);
    }

    #[test]
    fn companions_must_overlap_in_time() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.9, 60);
        let near = pattern(PatternType::RelationalResonance, Category::Relational, "b", 0.8, 0);
        let mut far = pattern(PatternType::ExploratoryDrift, Category::Exploratory, "c", 0.8, 0);
        far.first_seen = t0() + Duration::hours(2);
        far.last_seen = far.first_seen;
        let detector = detector_with(vec![seed.clone(), near, far]);

        let contributors = synthesizer().contributors(&seed, &detector);
        let types: Vec<PatternType> = contributors.iter().map(|p| p.pattern_type).collect();
        assert_eq!(types, vec![PatternType::RecurringAesthetic, PatternType::RelationalResonance]);
    }

    #[test]
    fn weak_companions_are_dropped_to_keep_quality() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.72, 0);
        let weak = pattern(PatternType::RelationalResonance, Category::Relational, "b", 0.5, 0);
        let detector = detector_with(vec![seed.clone(), weak]);
        let contributors = synthesizer().contributors(&seed, &detector);
        assert_eq!(contributors.len(), 1);
    }

    #[test]
    fn more_types_raise_potential() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0);
        let other = pattern(PatternType::RelationalResonance, Category::Relational, "b", 0.8, 0);
        let mut ledger = ResourceLedger::new(100.0, 16);

        let alone = synthesizer().run(&detector_with(vec![seed.clone()]), &mut ledger, t0());
        let paired = synthesizer().run(&detector_with(vec![seed, other]), &mut ledger, t0());
        let alone_cp = alone.intuitions[0].creative_potential;
        let paired_cp = paired
            .intuitions
            .iter()
            .find(|i| i.lineage.key().pattern_type == PatternType::RecurringAesthetic)
            .unwrap()
            .creative_potential;
        assert!(paired_cp > alone_cp);
    }

    #[test]
    fn persistence_raises_readiness() {
        let mut ledger = ResourceLedger::new(100.0, 16);
        let flash = synthesizer().run(
            &detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.9, 0)]),
            &mut ledger,
            t0(),
        );
        let sustained = synthesizer().run(
            &detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.9, 240)]),
            &mut ledger,
            t0(),
        );
        assert!(sustained.intuitions[0].manifestation_readiness > flash.intuitions[0].manifestation_readiness);
    }

    #[test]
    fn same_lineage_with_shared_support_is_not_resynthesized() {
        let detector = detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0)]);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let mut s = synthesizer();
        assert_eq!(s.run(&detector, &mut ledger, t0()).intuitions.len(), 1);
        assert!(s.run(&detector, &mut ledger, t0() + Duration::seconds(5)).intuitions.is_empty());

        // After the TTL the lineage may synthesize again.
        let later = t0() + Duration::seconds(1_300);
        assert_eq!(s.run(&detector, &mut ledger, later).intuitions.len(), 1);
        assert_eq!(s.synthesized_total(), 2);
    }

    #[test]
    fn refusal_queues_then_retries_first() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0);
        let detector = detector_with(vec![seed.clone()]);
        let mut ledger = ResourceLedger::new(10.0, 16);
        let mut s = synthesizer();

        let outcome = s.run(&detector, &mut ledger, t0());
        assert_eq!(outcome.queued, vec![Lineage(seed.key.clone())]);
        assert_eq!(ledger.balance(), 10.0);
        assert_eq!(s.pending()[0].attempts, 1);

        ledger.credit(30.0, LedgerReason::External, t0());
        let outcome = s.run(&detector, &mut ledger, t0());
        assert_eq!(outcome.intuitions.len(), 1);
        assert!(s.pending().is_empty());
    }

    #[test]
    fn retries_are_bounded() {
        let detector = detector_with(vec![pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0)]);
        let mut ledger = ResourceLedger::new(0.0, 16);
        let mut s = synthesizer();
        let mut dropped = 0;
        for i in 0..6 {
            let outcome = s.run(&detector, &mut ledger, t0() + Duration::seconds(i));
            dropped += outcome.dropped.len();
            if dropped > 0 {
                break;
            }
        }
        assert_eq!(dropped, 1);
        assert!(s.pending().is_empty());

        // A dropped lineage is not re-queued while its support is unchanged.
        let outcome = s.run(&detector, &mut ledger, t0() + Duration::seconds(10));
        assert!(outcome.queued.is_empty());
        assert!(s.pending().is_empty());
    }

    #[test]
    fn queued_entry_is_cancelled_when_seed_decays() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0);
        let mut ledger = ResourceLedger::new(0.0, 16);
        let mut s = synthesizer();
        s.run(&detector_with(vec![seed.clone()]), &mut ledger, t0());
        assert_eq!(s.pending().len(), 1);

        let mut weaker = seed;
        weaker.strength = 0.4;
        let outcome = s.run(&detector_with(vec![weaker]), &mut ledger, t0());
        assert_eq!(outcome.cancelled.len(), 1);
        assert!(s.pending().is_empty());
    }

    #[test]
    fn cancel_pending_removes_lineage() {
        let seed = pattern(PatternType::RecurringAesthetic, Category::Aesthetic, "a", 0.8, 0);
        let mut ledger = ResourceLedger::new(0.0, 16);
        let mut s = synthesizer();
        let detector = detector_with(vec![seed.clone()]);
        s.run(&detector, &mut ledger, t0());
        let lineage = Lineage(seed.key.clone());
        assert!(s.cancel_pending(&lineage, &detector));
        assert!(!s.cancel_pending(&lineage, &detector));

        ledger.credit(100.0, LedgerReason::External, t0());
        assert!(s.run(&detector, &mut ledger, t0()).intuitions.is_empty());

        // New support wakes the lineage up.
        let mut grown = seed;
        grown.supporting_observation_ids.insert(Uuid::new_v4());
        let outcome = s.run(&detector_with(vec![grown]), &mut ledger, t0());
        assert_eq!(outcome.intuitions.len(), 1);
    }
}
