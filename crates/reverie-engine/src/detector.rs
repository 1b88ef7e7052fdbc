//! PatternDetector: recurring structure over the observation window
//!
//! Matching is incremental: an update re-matches only the categories touched by
//! admitted or evicted observations (linear in the window for each), then
//! refreshes the recency term of every remaining pattern without re-matching.
//!
//! Within a category, observations sharing a tag are ordered by (timestamp, id)
//! and split into runs wherever consecutive gaps exceed the locality threshold.
//! Each pattern type picks its supporting members from a run:
//!
//! - recurring_aesthetic:  the whole run
//! - creative_momentum:    trailing members with non-decreasing intensity and a net rise
//! - relational_resonance: members at or above the resonance floor
//! - exploratory_drift:    the longest trailing stretch where every member adds an unseen tag
//!
//! Overlapping candidates of one type are resolved by support count, then mean
//! intensity, then earliest first_seen, then key. The result depends only on
//! window contents and the clock, never on admission order.

use crate::buffer::{BufferedObservation, ObservationBuffer};
use crate::config::DetectorConfig;
use chrono::{DateTime, Duration, Utc};
use reverie_core::{time, Category, DetectedPattern, PatternKey, PatternType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

/// What changed in one detector update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternDelta {
    pub appeared: Vec<PatternKey>,
    pub updated: Vec<PatternKey>,
    pub removed: Vec<PatternKey>,
}

impl PatternDelta {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
pub struct PatternDetector {
    config: DetectorConfig,
    patterns: BTreeMap<PatternKey, DetectedPattern>,
}

/// A supporting set proposed for one key, before overlap resolution.
struct Candidate<'a> {
    key: PatternKey,
    members: Vec<&'a BufferedObservation>,
    mean_intensity: f64,
}

impl<'a> Candidate<'a> {
    fn new(key: PatternKey, members: Vec<&'a BufferedObservation>) -> Self {
        let mean_intensity = members.iter().map(|m| m.intensity()).sum::<f64>() / members.len() as f64;
        Self { key, members, mean_intensity }
    }

    fn first_seen(&self) -> DateTime<Utc> {
        self.members[0].timestamp()
    }

    fn last_seen(&self) -> DateTime<Utc> {
        self.members[self.members.len() - 1].timestamp()
    }

    /// Preferred candidates sort first.
    fn preference(&self, other: &Self) -> Ordering {
        other
            .members
            .len()
            .cmp(&self.members.len())
            .then_with(|| other.mean_intensity.total_cmp(&self.mean_intensity))
            .then_with(|| self.first_seen().cmp(&other.first_seen()))
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.members[0].id().cmp(&other.members[0].id()))
    }
}

impl PatternDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config, patterns: BTreeMap::new() }
    }

    /// Rebuild from persisted patterns, verbatim.
    pub fn restore(config: DetectorConfig, patterns: Vec<DetectedPattern>) -> Self {
        let patterns = patterns.into_iter().map(|p| (p.key.clone(), p)).collect();
        Self { config, patterns }
    }

    /// Re-match the touched categories and refresh every pattern's recency.
    pub fn update(
        &mut self,
        window: &ObservationBuffer,
        touched: &BTreeSet<Category>,
        now: DateTime<Utc>,
    ) -> PatternDelta {
        let mut delta = PatternDelta::default();
        for &category in touched {
            let fresh = self.match_category(window, category, now);

            let stale: Vec<PatternKey> = self
                .patterns
                .keys()
                .filter(|k| k.category == category && !fresh.contains_key(*k))
                .cloned()
                .collect();
            for key in stale {
                self.patterns.remove(&key);
                delta.removed.push(key);
            }

            for (key, pattern) in fresh {
                match self.patterns.insert(key.clone(), pattern.clone()) {
                    None => delta.appeared.push(key),
                    Some(previous) if previous != pattern => delta.updated.push(key),
                    Some(_) => {}
                }
            }
        }
        self.refresh_recency(now);

        if !delta.is_empty() {
            debug!(
                "Patterns: +{} ~{} -{} ({} active)",
                delta.appeared.len(),
                delta.updated.len(),
                delta.removed.len(),
                self.patterns.len()
            );
        }
        delta
    }

    /// Re-match every category.
    pub fn rescan(&mut self, window: &ObservationBuffer, now: DateTime<Utc>) -> PatternDelta {
        let all: BTreeSet<Category> = Category::ALL.into_iter().collect();
        self.update(window, &all, now)
    }

    pub fn get(&self, key: &PatternKey) -> Option<&DetectedPattern> {
        self.patterns.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectedPattern> {
        self.patterns.values()
    }

    /// Copies of all active patterns, in key order.
    pub fn patterns(&self) -> Vec<DetectedPattern> {
        self.patterns.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Weighted mix of saturating support, mean intensity and recency decay.
    pub fn score(&self, support: usize, mean_intensity: f64, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let c = &self.config;
        let total = c.support_weight + c.intensity_weight + c.recency_weight;
        let support_term = 1.0 - (-c.support_rate * support as f64).exp();
        let age_secs = (now - last_seen).num_milliseconds().max(0) as f64 / 1000.0;
        let recency = (-age_secs / c.recency_tau_secs).exp();
        let raw = c.support_weight * support_term + c.intensity_weight * mean_intensity + c.recency_weight * recency;
        (raw / total).clamp(0.0, 1.0)
    }

    fn refresh_recency(&mut self, now: DateTime<Utc>) {
        let rescored: Vec<(PatternKey, f64)> = self
            .patterns
            .values()
            .map(|p| (p.key.clone(), self.score(p.support(), p.mean_intensity, p.last_seen, now)))
            .collect();
        for (key, strength) in rescored {
            if let Some(p) = self.patterns.get_mut(&key) {
                p.strength = strength;
            }
        }
    }

    fn match_category(
        &self,
        window: &ObservationBuffer,
        category: Category,
        now: DateTime<Utc>,
    ) -> BTreeMap<PatternKey, DetectedPattern> {
        let mut members: Vec<&BufferedObservation> = window.of_category(category).collect();
        members.sort_by(|a, b| a.timestamp().cmp(&b.timestamp()).then_with(|| a.id().cmp(&b.id())));

        let mut by_tag: BTreeMap<&str, Vec<&BufferedObservation>> = BTreeMap::new();
        for &m in &members {
            for tag in &m.tags {
                by_tag.entry(tag.as_str()).or_default().push(m);
            }
        }

        let locality = time::interval(self.config.locality_secs);
        let mut found = BTreeMap::new();

        for &pattern_type in category.pattern_types() {
            let mut candidates = Vec::new();
            for (tag, tagged) in &by_tag {
                if tagged.len() < 2 {
                    continue;
                }
                for run in split_runs(tagged, locality) {
                    let support = self.match_run(pattern_type, &run);
                    if support.len() >= 2 {
                        let key = PatternKey::new(pattern_type, category, *tag);
                        candidates.push(Candidate::new(key, support));
                    }
                }
            }
            candidates.sort_by(|a, b| a.preference(b));

            let mut claimed: BTreeSet<Uuid> = BTreeSet::new();
            for candidate in candidates {
                if found.contains_key(&candidate.key) {
                    continue;
                }
                if candidate.members.iter().any(|m| claimed.contains(&m.id())) {
                    continue;
                }
                claimed.extend(candidate.members.iter().map(|m| m.id()));
                let pattern = DetectedPattern {
                    key: candidate.key.clone(),
                    pattern_type,
                    strength: self.score(candidate.members.len(), candidate.mean_intensity, candidate.last_seen(), now),
                    supporting_observation_ids: candidate.members.iter().map(|m| m.id()).collect(),
                    first_seen: candidate.first_seen(),
                    last_seen: candidate.last_seen(),
                    mean_intensity: candidate.mean_intensity,
                };
                found.insert(candidate.key, pattern);
            }
        }
        found
    }

    fn match_run<'a>(&self, pattern_type: PatternType, run: &[&'a BufferedObservation]) -> Vec<&'a BufferedObservation> {
        match pattern_type {
            PatternType::RecurringAesthetic => run.to_vec(),
            PatternType::CreativeMomentum => {
                let mut start = run.len().saturating_sub(1);
                while start > 0 && run[start - 1].intensity() <= run[start].intensity() {
                    start -= 1;
                }
                let rising = &run[start..];
                match (rising.first(), rising.last()) {
                    (Some(first), Some(last))
                        if rising.len() >= 2 && last.intensity() - first.intensity() >= self.config.min_momentum_rise =>
                    {
                        rising.to_vec()
                    }
                    _ => Vec::new(),
                }
            }
            PatternType::RelationalResonance => run
                .iter()
                .copied()
                .filter(|m| m.intensity() >= self.config.resonance_floor)
                .collect(),
            PatternType::ExploratoryDrift => {
                let start = (0..run.len()).find(|&s| drifts(&run[s..])).unwrap_or(run.len());
                run[start..].to_vec()
            }
        }
    }
}

/// Whether every member carries at least one tag unseen earlier in `members`.
fn drifts(members: &[&BufferedObservation]) -> bool {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    members.iter().all(|m| {
        let novel = m.tags.iter().any(|t| !seen.contains(t.as_str()));
        seen.extend(m.tags.iter().map(String::as_str));
        novel
    })
}

/// Split time-ordered observations wherever the gap exceeds `locality`.
fn split_runs<'a>(tagged: &[&'a BufferedObservation], locality: Duration) -> Vec<Vec<&'a BufferedObservation>> {
    let mut runs: Vec<Vec<&BufferedObservation>> = Vec::new();
    for &m in tagged {
        match runs.last_mut() {
            Some(run) if run.last().is_some_and(|prev| m.timestamp() - prev.timestamp() <= locality) => {
                run.push(m)
            }
            _ => runs.push(vec![m]),
        }
    }
    runs
}
