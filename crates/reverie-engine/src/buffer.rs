//! ObservationBuffer: the sliding window of admitted observations
//!
//! Admission order is FIFO. Two eviction triggers, oldest timestamp first: age
//! beyond the horizon (relative to the engine clock) and count beyond capacity.
//! A full window refuses an observation older than everything it holds, so the
//! final window does not depend on admission order.
//! Admission is paid for through the ResourceLedger and never blocks.

use crate::config::WindowConfig;
use crate::ledger::ResourceLedger;
use chrono::{DateTime, Duration, Utc};
use reverie_core::{time, Category, LedgerReason, Observation, Refused};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// An observation plus the features derived at admission.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedObservation {
    pub observation: Observation,
    /// Trimmed, deduplicated descriptor tags.
    pub tags: BTreeSet<String>,
    /// Admission sequence number within this engine.
    pub seq: u64,
}

impl BufferedObservation {
    pub fn id(&self) -> Uuid {
        self.observation.id
    }

    pub fn category(&self) -> Category {
        self.observation.category
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.observation.timestamp
    }

    pub fn intensity(&self) -> f64 {
        self.observation.intensity
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionReceipt {
    pub observation_id: Uuid,
    pub admitted_at: DateTime<Utc>,
    /// Observations evicted by this admission, oldest first.
    pub evicted: Vec<Uuid>,
    pub balance_after: f64,
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Default)]
pub struct Eviction {
    pub evicted: Vec<Uuid>,
    pub touched: BTreeSet<Category>,
}

impl Eviction {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

#[derive(Debug)]
pub struct ObservationBuffer {
    entries: VecDeque<BufferedObservation>,
    config: WindowConfig,
    /// Reference counts of tags across the window.
    vocabulary: BTreeMap<String, usize>,
    next_seq: u64,
}

impl ObservationBuffer {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            config,
            vocabulary: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Validate, pay, append, evict. On refusal the window is unchanged.
    pub fn admit(
        &mut self,
        observation: Observation,
        ledger: &mut ResourceLedger,
        now: DateTime<Utc>,
    ) -> Result<(AdmissionReceipt, Eviction), Refused> {
        let tags = self
            .validate(&observation, now)
            .map_err(|msg| Refused::invalid_input(observation.id, msg))?;

        let cost = self.config.admission_cost;
        if !ledger.authorize(cost, LedgerReason::Admission, now) {
            return Err(Refused::insufficient_energy(observation.id, cost, ledger.balance()));
        }

        let observation_id = observation.id;
        let category = observation.category;
        self.push(observation, tags);

        let mut eviction = self.evict(now);
        eviction.touched.insert(category);
        debug!(
            "Admitted {} ({}), window {}/{}, evicted {}",
            observation_id,
            category,
            self.entries.len(),
            self.config.capacity,
            eviction.evicted.len()
        );

        let receipt = AdmissionReceipt {
            observation_id,
            admitted_at: now,
            evicted: eviction.evicted.clone(),
            balance_after: ledger.balance(),
        };
        Ok((receipt, eviction))
    }

    /// Drop observations past the horizon, then the oldest beyond capacity.
    pub fn evict(&mut self, now: DateTime<Utc>) -> Eviction {
        let mut eviction = Eviction::default();
        let cutoff = time::saturating_sub(now, self.horizon());

        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut aged = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.timestamp() < cutoff {
                aged.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        for entry in aged {
            self.forget(&entry, &mut eviction);
        }

        while self.entries.len() > self.config.capacity {
            let Some(index) = self.oldest_index() else { break };
            if let Some(entry) = self.entries.remove(index) {
                self.forget(&entry, &mut eviction);
            }
        }
        eviction
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn horizon(&self) -> Duration {
        time::interval(self.config.horizon_secs)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.iter().any(|e| &e.observation.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedObservation> {
        self.entries.iter()
    }

    pub fn of_category(&self, category: Category) -> impl Iterator<Item = &BufferedObservation> {
        self.entries.iter().filter(move |e| e.category() == category)
    }

    /// Copies of the windowed observations, in admission order.
    pub fn observations(&self) -> Vec<Observation> {
        self.entries.iter().map(|e| e.observation.clone()).collect()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    /// Position of the entry with the smallest `(timestamp, id)`.
    fn oldest_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.timestamp().cmp(&b.timestamp()).then_with(|| a.id().cmp(&b.id())))
            .map(|(i, _)| i)
    }

    /// Rebuild a window from persisted observations, skipping ones past the
    /// horizon or failing validation. Returns the buffer and how many were skipped.
    pub fn restore(
        config: WindowConfig,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
    ) -> (Self, usize) {
        let mut buffer = Self::new(config);
        let mut skipped = 0;
        for observation in observations {
            match buffer.validate(&observation, now) {
                Ok(tags) => buffer.push(observation, tags),
                Err(msg) => {
                    debug!("Skipping restored observation {}: {}", observation.id, msg);
                    skipped += 1;
                }
            }
        }
        skipped += buffer.evict(now).evicted.len();
        (buffer, skipped)
    }

    fn push(&mut self, observation: Observation, tags: BTreeSet<String>) {
        for tag in &tags {
            *self.vocabulary.entry(tag.clone()).or_insert(0) += 1;
        }
        self.entries.push_back(BufferedObservation {
            observation,
            tags,
            seq: self.next_seq,
        });
        self.next_seq += 1;
    }

    fn forget(&mut self, entry: &BufferedObservation, eviction: &mut Eviction) {
        for tag in &entry.tags {
            if let Some(count) = self.vocabulary.get_mut(tag) {
                *count -= 1;
                if *count == 0 {
                    self.vocabulary.remove(tag);
                }
            }
        }
        eviction.evicted.push(entry.id());
        eviction.touched.insert(entry.category());
    }

    fn validate(&self, observation: &Observation, now: DateTime<Utc>) -> Result<BTreeSet<String>, String> {
        let c = &self.config;
        if !observation.intensity.is_finite() || !(0.0..=1.0).contains(&observation.intensity) {
            return Err(format!("intensity {} outside [0, 1]", observation.intensity));
        }
        if observation.descriptors.is_empty() {
            return Err("no descriptors".to_string());
        }
        if observation.descriptors.len() > c.max_tags {
            return Err(format!("{} descriptors exceed limit {}", observation.descriptors.len(), c.max_tags));
        }
        let mut tags = BTreeSet::new();
        for raw in &observation.descriptors {
            let tag = raw.trim();
            if tag.is_empty() {
                return Err("blank descriptor".to_string());
            }
            if tag.len() > c.max_tag_len {
                return Err(format!("descriptor longer than {} bytes", c.max_tag_len));
            }
            tags.insert(tag.to_string());
        }
        if observation.context.len() > c.max_context_entries {
            return Err(format!(
                "{} context entries exceed limit {}",
                observation.context.len(),
                c.max_context_entries
            ));
        }
        if observation.timestamp < time::saturating_sub(now, self.horizon()) {
            return Err("timestamp older than the window horizon".to_string());
        }
        if self.entries.len() >= c.capacity {
            let oldest_held = self
                .oldest_index()
                .and_then(|i| self.entries.get(i))
                .map(|e| (e.timestamp(), e.id()));
            if oldest_held.is_some_and(|oldest| (observation.timestamp, observation.id) < oldest) {
                return Err("window is full and the observation is older than all it holds".to_string());
            }
        }
        if self.contains(&observation.id) {
            return Err(format!("observation {} already in window", observation.id));
        }
        let new_tags = tags.iter().filter(|t| !self.vocabulary.contains_key(*t)).count();
        if self.vocabulary.len() + new_tags > c.max_vocabulary {
            return Err(format!("tag vocabulary would exceed {}", c.max_vocabulary));
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::RefusalReason;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn obs(cat: Category, tags: &[&str], intensity: f64, at: DateTime<Utc>) -> Observation {
        Observation::new(cat, tags.iter().copied(), intensity).at(at)
    }

    fn buffer_with(capacity: usize, horizon_secs: u64) -> ObservationBuffer {
        ObservationBuffer::new(WindowConfig { capacity, horizon_secs, ..WindowConfig::default() })
    }

    #[test]
    fn admit_debits_and_appends() {
        let mut buffer = buffer_with(10, 600);
        let mut ledger = ResourceLedger::new(5.0, 16);
        let (receipt, _) = buffer
            .admit(obs(Category::Aesthetic, &["spiral"], 0.5, t0()), &mut ledger, t0())
            .unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(receipt.balance_after, 4.0);
        assert!(receipt.evicted.is_empty());
    }

    #[test]
    fn zero_balance_refuses_and_leaves_window_unchanged() {
        let mut buffer = buffer_with(10, 600);
        let mut ledger = ResourceLedger::new(0.0, 16);
        let err = buffer
            .admit(obs(Category::Aesthetic, &["spiral"], 0.5, t0()), &mut ledger, t0())
            .unwrap_err();
        assert!(matches!(err.reason, RefusalReason::InsufficientEnergy { .. }));
        assert!(buffer.is_empty());
        assert_eq!(buffer.vocabulary_size(), 0);
    }

    #[test]
    fn invalid_input_costs_nothing() {
        let mut buffer = buffer_with(10, 600);
        let mut ledger = ResourceLedger::new(5.0, 16);
        for bad in [
            obs(Category::Creative, &["x"], 1.5, t0()),
            obs(Category::Creative, &["x"], f64::NAN, t0()),
            obs(Category::Creative, &[], 0.5, t0()),
            obs(Category::Creative, &["  "], 0.5, t0()),
            obs(Category::Creative, &["x"], 0.5, t0() - Duration::seconds(601)),
        ] {
            let err = buffer.admit(bad, &mut ledger, t0()).unwrap_err();
            assert!(matches!(err.reason, RefusalReason::InvalidInput(_)));
        }
        assert_eq!(ledger.balance(), 5.0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut buffer = buffer_with(10, 600);
        let mut ledger = ResourceLedger::new(5.0, 16);
        let o = obs(Category::Relational, &["kin"], 0.5, t0());
        buffer.admit(o.clone(), &mut ledger, t0()).unwrap();
        let err = buffer.admit(o, &mut ledger, t0()).unwrap_err();
        assert!(matches!(err.reason, RefusalReason::InvalidInput(_)));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut buffer = buffer_with(3, 600);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let mut ids = Vec::new();
        for i in 0..5 {
            let o = obs(Category::Aesthetic, &["a"], 0.5, t0() + Duration::seconds(i));
            ids.push(o.id);
            let (receipt, _) = buffer.admit(o, &mut ledger, t0() + Duration::seconds(i)).unwrap();
            assert!(buffer.len() <= 3);
            if i >= 3 {
                assert_eq!(receipt.evicted, vec![ids[(i - 3) as usize]]);
            }
        }
        let remaining: Vec<Uuid> = buffer.iter().map(|e| e.id()).collect();
        assert_eq!(remaining, ids[2..].to_vec());
    }

    #[test]
    fn capacity_evicts_by_timestamp_not_admission_order() {
        let mut buffer = buffer_with(2, 600);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let at = |secs| t0() + Duration::seconds(secs);
        let late = obs(Category::Aesthetic, &["a"], 0.5, at(20));
        let mid = obs(Category::Aesthetic, &["a"], 0.5, at(10));
        let fresh = obs(Category::Aesthetic, &["a"], 0.5, at(15));
        buffer.admit(late.clone(), &mut ledger, at(20)).unwrap();
        buffer.admit(mid.clone(), &mut ledger, at(20)).unwrap();
        let (receipt, _) = buffer.admit(fresh.clone(), &mut ledger, at(20)).unwrap();
        assert_eq!(receipt.evicted, vec![mid.id]);

        let kept: BTreeSet<Uuid> = buffer.iter().map(|e| e.id()).collect();
        assert_eq!(kept, BTreeSet::from([late.id, fresh.id]));
    }

    #[test]
    fn full_window_refuses_observations_older_than_its_contents() {
        let mut buffer = buffer_with(2, 600);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let at = |secs| t0() + Duration::seconds(secs);
        for secs in [20, 10] {
            buffer.admit(obs(Category::Aesthetic, &["a"], 0.5, at(secs)), &mut ledger, at(20)).unwrap();
        }
        let err = buffer
            .admit(obs(Category::Aesthetic, &["a"], 0.5, at(0)), &mut ledger, at(20))
            .unwrap_err();
        assert!(matches!(err.reason, RefusalReason::InvalidInput(_)));
        assert_eq!(ledger.balance(), 98.0);

        let mut reversed = buffer_with(2, 600);
        for secs in [0, 10, 20] {
            reversed.admit(obs(Category::Aesthetic, &["a"], 0.5, at(secs)), &mut ledger, at(secs)).unwrap();
        }
        let timestamps = |b: &ObservationBuffer| b.iter().map(|e| e.timestamp()).collect::<BTreeSet<_>>();
        assert_eq!(timestamps(&buffer), timestamps(&reversed));
    }

    #[test]
    fn timestamps_at_the_ends_of_the_range_do_not_panic() {
        let mut buffer = buffer_with(10, 600);
        let mut ledger = ResourceLedger::new(100.0, 16);
        let first = DateTime::<Utc>::MIN_UTC;
        buffer.admit(obs(Category::Aesthetic, &["a"], 0.5, first), &mut ledger, first).unwrap();
        let last = DateTime::<Utc>::MAX_UTC;
        let (receipt, _) = buffer.admit(obs(Category::Aesthetic, &["a"], 0.5, last), &mut ledger, last).unwrap();
        assert_eq!(receipt.evicted.len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn horizon_evicts_by_age() {
        let mut buffer = buffer_with(10, 60);
        let mut ledger = ResourceLedger::new(100.0, 16);
        buffer.admit(obs(Category::Aesthetic, &["a"], 0.5, t0()), &mut ledger, t0()).unwrap();
        let later = t0() + Duration::seconds(61);
        let (receipt, eviction) = buffer
            .admit(obs(Category::Creative, &["b"], 0.5, later), &mut ledger, later)
            .unwrap();
        assert_eq!(receipt.evicted.len(), 1);
        assert!(eviction.touched.contains(&Category::Aesthetic));
        assert!(eviction.touched.contains(&Category::Creative));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn vocabulary_is_bounded_and_released_on_eviction() {
        let mut buffer = ObservationBuffer::new(WindowConfig {
            capacity: 1,
            max_vocabulary: 2,
            ..WindowConfig::default()
        });
        let mut ledger = ResourceLedger::new(100.0, 16);
        buffer.admit(obs(Category::Aesthetic, &["a", "b"], 0.5, t0()), &mut ledger, t0()).unwrap();
        let err = buffer
            .admit(obs(Category::Aesthetic, &["a", "b", "c"], 0.5, t0()), &mut ledger, t0())
            .unwrap_err();
        assert!(matches!(err.reason, RefusalReason::InvalidInput(_)));

        let later = t0() + Duration::seconds(10_000);
        buffer.evict(later);
        assert_eq!(buffer.vocabulary_size(), 0);
        buffer.admit(obs(Category::Aesthetic, &["c", "d"], 0.5, later), &mut ledger, later).unwrap();
        assert_eq!(buffer.vocabulary_size(), 2);
    }

    #[test]
    fn restore_skips_aged_observations() {
        let config = WindowConfig { horizon_secs: 60, ..WindowConfig::default() };
        let old = obs(Category::Aesthetic, &["a"], 0.5, t0());
        let fresh = obs(Category::Aesthetic, &["a"], 0.5, t0() + Duration::seconds(100));
        let (buffer, skipped) =
            ObservationBuffer::restore(config, vec![old, fresh.clone()], t0() + Duration::seconds(100));
        assert_eq!(skipped, 1);
        assert_eq!(buffer.observations(), vec![fresh]);
    }
}
