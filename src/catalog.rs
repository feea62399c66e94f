//! Catalog store for obfuscation strategies and detection methods
//!
//! The catalog is loaded once at startup and never grows or shrinks
//! afterwards. All mutable state lives in per-record atomic cells, so the
//! read paths taken by selection and risk estimation never lock and never
//! observe a torn estimate/sample-count pair: both values are packed into a
//! single `AtomicU64` and updated with compare-and-swap.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

use crate::config::{DetectionSpec, StrategySpec};
use crate::snapshot::{RecordKind, ScoreEntry, ScoreSnapshot};

/// Errors from catalog lookups
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CatalogError {
    /// The id is not present in either catalog table.
    #[error("unknown catalog id: {0}")]
    NotFound(String),
}

/// Fixed-point scale for estimates stored in the packed score cell.
///
/// Estimates live in [0,1]; mapping that interval onto the full u32 range
/// keeps quantization error around 2e-10 per update, far below the 1e-6
/// convergence tolerance the update rule promises.
const ESTIMATE_SCALE: f64 = u32::MAX as f64;

fn pack(estimate: f64, samples: u32) -> u64 {
    let fixed = (estimate.clamp(0.0, 1.0) * ESTIMATE_SCALE).round() as u32;
    (u64::from(fixed) << 32) | u64::from(samples)
}

fn unpack(bits: u64) -> (f64, u32) {
    let fixed = (bits >> 32) as u32;
    (f64::from(fixed) / ESTIMATE_SCALE, bits as u32)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Estimate/sample-count pair packed into one atomic word.
///
/// The moving-average update `new = old + α(observed - old)` with
/// `α = 1/min(n+1, cap)` is a plain running mean until `cap` samples have
/// been seen and an exponentially-weighted average afterwards. Applying the
/// same multiset of observations in any order converges to the same value
/// within quantization tolerance while in the running-mean regime.
#[derive(Debug)]
pub struct ScoreCell(AtomicU64);

impl ScoreCell {
    fn new(estimate: f64) -> Self {
        Self(AtomicU64::new(pack(estimate, 0)))
    }

    /// Current (estimate, sample_count) pair, read as one unit
    pub fn load(&self) -> (f64, u32) {
        unpack(self.0.load(Ordering::Acquire))
    }

    /// Fold one observation into the estimate; returns the updated pair
    pub(crate) fn observe(&self, observed: f64, cap: u32) -> (f64, u32) {
        let observed = observed.clamp(0.0, 1.0);
        let cap = cap.max(1);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (estimate, samples) = unpack(current);
            let alpha = 1.0 / f64::from(samples.saturating_add(1).min(cap));
            let next_estimate = estimate + alpha * (observed - estimate);
            let next_samples = samples.saturating_add(1).min(cap);
            let next = pack(next_estimate, next_samples);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return unpack(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Move the estimate toward 1.0 by `amount` of the remaining headroom;
    /// returns the updated estimate
    pub(crate) fn nudge_up(&self, amount: f64, cap: u32) -> f64 {
        let amount = amount.clamp(0.0, 1.0);
        let cap = cap.max(1);
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let (estimate, samples) = unpack(current);
            let next_estimate = estimate + amount * (1.0 - estimate);
            let next = pack(next_estimate, samples.saturating_add(1).min(cap));
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return unpack(next).0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Overwrite the pair, used when warm-starting from a snapshot
    pub(crate) fn restore(&self, estimate: f64, samples: u32) {
        self.0.store(pack(estimate, samples), Ordering::Release);
    }
}

/// One traffic-obfuscation technique with its tracked score
#[derive(Debug)]
pub struct StrategyRecord {
    pub id: String,
    pub category: String,
    pub baseline_prior: f64,
    /// Relative CPU/latency overhead unit, higher is heavier
    pub performance_cost: f64,
    /// Strategies sharing a group cannot be combined
    pub exclusion_group: Option<String>,
    enabled: AtomicBool,
    score: ScoreCell,
    last_used: AtomicI64,
}

impl StrategyRecord {
    fn from_spec(spec: &StrategySpec) -> Self {
        Self {
            id: spec.id.clone(),
            category: spec.category.clone(),
            baseline_prior: spec.baseline_prior.clamp(0.0, 1.0),
            performance_cost: spec.performance_cost,
            exclusion_group: spec.exclusion_group.clone(),
            enabled: AtomicBool::new(spec.enabled),
            score: ScoreCell::new(spec.baseline_prior.clamp(0.0, 1.0)),
            last_used: AtomicI64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Current (success estimate, sample count)
    pub fn success_estimate(&self) -> (f64, u32) {
        self.score.load()
    }

    pub fn last_used(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.last_used.load(Ordering::Relaxed))
    }

    /// Fold one connection observation into the success estimate
    pub(crate) fn observe(&self, observed: f64, cap: u32) -> (f64, u32) {
        let updated = self.score.observe(observed, cap);
        self.last_used.store(now_millis(), Ordering::Relaxed);
        updated
    }

    pub(crate) fn restore(&self, estimate: f64, samples: u32, at: Option<DateTime<Utc>>) {
        self.score.restore(estimate, samples);
        self.last_used
            .store(at.map(|t| t.timestamp_millis()).unwrap_or(0), Ordering::Relaxed);
    }
}

impl PartialEq for StrategyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.category == other.category
            && self.baseline_prior == other.baseline_prior
            && self.performance_cost == other.performance_cost
            && self.exclusion_group == other.exclusion_group
            && self.is_enabled() == other.is_enabled()
            && self.success_estimate() == other.success_estimate()
            && self.last_used.load(Ordering::Relaxed) == other.last_used.load(Ordering::Relaxed)
    }
}

/// One modeled inspection technique with its tracked prevalence
#[derive(Debug)]
pub struct DetectionRecord {
    pub id: String,
    pub category: String,
    pub baseline_prevalence: f64,
    countered_by: HashSet<String>,
    enabled: AtomicBool,
    prevalence: ScoreCell,
    last_updated: AtomicI64,
}

impl DetectionRecord {
    fn from_spec(spec: &DetectionSpec) -> Self {
        Self {
            id: spec.id.clone(),
            category: spec.category.clone(),
            baseline_prevalence: spec.baseline_prevalence.clamp(0.0, 1.0),
            countered_by: spec.countered_by.iter().cloned().collect(),
            enabled: AtomicBool::new(true),
            prevalence: ScoreCell::new(spec.baseline_prevalence.clamp(0.0, 1.0)),
            last_updated: AtomicI64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Current (prevalence estimate, observation count)
    pub fn prevalence_estimate(&self) -> (f64, u32) {
        self.prevalence.load()
    }

    /// Whether the given strategy reduces this method's effectiveness
    pub fn counters(&self, strategy_id: &str) -> bool {
        self.countered_by.contains(strategy_id)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.last_updated.load(Ordering::Relaxed))
    }

    /// Nudge prevalence upward after an unattributed block
    pub(crate) fn nudge(&self, amount: f64, cap: u32) -> f64 {
        let updated = self.prevalence.nudge_up(amount, cap);
        self.last_updated.store(now_millis(), Ordering::Relaxed);
        updated
    }

    pub(crate) fn restore(&self, estimate: f64, samples: u32, at: Option<DateTime<Utc>>) {
        self.prevalence.restore(estimate, samples);
        self.last_updated
            .store(at.map(|t| t.timestamp_millis()).unwrap_or(0), Ordering::Relaxed);
    }
}

/// Immutable-at-load registry of strategies and detection methods
#[derive(Debug)]
pub struct Catalog {
    strategies: BTreeMap<String, StrategyRecord>,
    detections: BTreeMap<String, DetectionRecord>,
}

impl Catalog {
    /// Build the catalog from validated configuration records
    pub fn from_specs(strategies: &[StrategySpec], detections: &[DetectionSpec]) -> Self {
        let strategies = strategies
            .iter()
            .map(|s| (s.id.clone(), StrategyRecord::from_spec(s)))
            .collect();
        let detections = detections
            .iter()
            .map(|d| (d.id.clone(), DetectionRecord::from_spec(d)))
            .collect();
        Self { strategies, detections }
    }

    /// Look up a strategy by id
    pub fn strategy(&self, id: &str) -> Result<&StrategyRecord, CatalogError> {
        self.strategies
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Look up a detection method by id
    pub fn detection(&self, id: &str) -> Result<&DetectionRecord, CatalogError> {
        self.detections
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// All strategies in id order, including disabled ones
    pub fn strategies(&self) -> impl Iterator<Item = &StrategyRecord> {
        self.strategies.values()
    }

    /// All detection methods in id order, including disabled ones
    pub fn detections(&self) -> impl Iterator<Item = &DetectionRecord> {
        self.detections.values()
    }

    /// Enabled strategies in id order, optionally restricted to a category
    pub fn enabled_strategies(&self, category: Option<&str>) -> Vec<&StrategyRecord> {
        self.strategies
            .values()
            .filter(|s| s.is_enabled())
            .filter(|s| category.map_or(true, |c| s.category == c))
            .collect()
    }

    /// Enabled detection methods in id order
    pub fn enabled_detections(&self) -> Vec<&DetectionRecord> {
        self.detections.values().filter(|d| d.is_enabled()).collect()
    }

    /// Enable or disable a strategy; disabled strategies are filtered at
    /// selection time, never retroactively
    pub fn set_strategy_enabled(&self, id: &str, enabled: bool) -> Result<(), CatalogError> {
        self.strategy(id)?.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    /// Enable or disable a detection method
    pub fn set_detection_enabled(&self, id: &str, enabled: bool) -> Result<(), CatalogError> {
        self.detection(id)?.enabled.store(enabled, Ordering::Release);
        Ok(())
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }

    /// Point-in-time view of every record's score; never blocks writers
    pub fn snapshot(&self) -> ScoreSnapshot {
        let mut entries = Vec::with_capacity(self.strategies.len() + self.detections.len());
        for record in self.strategies.values() {
            let (estimate, samples) = record.success_estimate();
            entries.push(ScoreEntry {
                id: record.id.clone(),
                kind: RecordKind::Strategy,
                current_estimate: estimate,
                sample_count: samples,
                last_updated: record.last_used(),
            });
        }
        for record in self.detections.values() {
            let (estimate, samples) = record.prevalence_estimate();
            entries.push(ScoreEntry {
                id: record.id.clone(),
                kind: RecordKind::Detection,
                current_estimate: estimate,
                sample_count: samples,
                last_updated: record.last_updated(),
            });
        }
        ScoreSnapshot { taken_at: Utc::now(), entries }
    }

    /// Overwrite live scores from a saved snapshot; returns how many entries
    /// were applied. Entries for unknown ids are logged and skipped.
    pub fn warm_start(&self, snapshot: &ScoreSnapshot) -> usize {
        let mut applied = 0;
        for entry in &snapshot.entries {
            let found = match entry.kind {
                RecordKind::Strategy => match self.strategies.get(&entry.id) {
                    Some(record) => {
                        record.restore(entry.current_estimate, entry.sample_count, entry.last_updated);
                        true
                    }
                    None => false,
                },
                RecordKind::Detection => match self.detections.get(&entry.id) {
                    Some(record) => {
                        record.restore(entry.current_estimate, entry.sample_count, entry.last_updated);
                        true
                    }
                    None => false,
                },
            };
            if found {
                applied += 1;
            } else {
                warn!(id = %entry.id, "snapshot entry does not match any catalog record, skipping");
            }
        }
        applied
    }
}
