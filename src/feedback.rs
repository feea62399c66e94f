//! Outcome feedback processing
//!
//! Ingests per-connection results and folds them into the catalog
//! scoreboard. Reporting is best-effort by contract: a failed score update
//! must never break the caller's connection flow, so every error path here
//! is absorbed and logged. Score updates go through the catalog's
//! compare-and-swap cells and therefore tolerate any arrival order across
//! threads.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::constants::{DRIFT_CONFIDENCE, DRIFT_NUDGE, OUTCOME_WINDOW};
use crate::selection::StrategyCombination;

/// Result of one connection attempt, as observed by the transport caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionResult {
    Success,
    Blocked,
    Degraded,
    TimedOut,
}

impl ConnectionResult {
    /// Observation value folded into member strategy estimates
    pub fn observed_value(self) -> f64 {
        match self {
            ConnectionResult::Success => 1.0,
            ConnectionResult::Blocked => 0.0,
            ConnectionResult::Degraded | ConnectionResult::TimedOut => 0.5,
        }
    }
}

/// One reported connection outcome; consumed once by the processor
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub result: ConnectionResult,
    pub latency: Duration,
}

/// Retained outcome summary for trend detection
#[derive(Debug, Clone)]
struct OutcomeRecord {
    result: ConnectionResult,
    latency: Duration,
    at: DateTime<Utc>,
}

/// Folds connection outcomes into the catalog scoreboard
pub struct FeedbackProcessor {
    catalog: Arc<Catalog>,
    cap_samples: u32,
    recent: Mutex<VecDeque<OutcomeRecord>>,
}

impl FeedbackProcessor {
    pub fn new(catalog: Arc<Catalog>, cap_samples: u32) -> Self {
        Self {
            catalog,
            cap_samples,
            recent: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
        }
    }

    /// Fold one outcome into the scoreboard. Never fails the caller.
    pub fn report(&self, combination: &StrategyCombination, outcome: &ConnectionOutcome) {
        let observed = outcome.result.observed_value();
        for id in &combination.strategies {
            match self.catalog.strategy(id) {
                Ok(record) if record.is_enabled() => {
                    let (estimate, samples) = record.observe(observed, self.cap_samples);
                    debug!(
                        strategy = %id,
                        estimate,
                        samples,
                        result = ?outcome.result,
                        "strategy score updated"
                    );
                }
                Ok(_) => {
                    warn!(strategy = %id, "outcome reported for disabled strategy, ignoring");
                }
                Err(_) => {
                    warn!(strategy = %id, "outcome reported for unknown strategy, ignoring");
                }
            }
        }

        if outcome.result == ConnectionResult::Blocked {
            self.nudge_uncountered(combination);
        }

        self.remember(outcome);
    }

    /// Adversary-drift model: a block that no countered vector explains is
    /// weak evidence that some uncountered method has improved. Every
    /// enabled detection method whose category the combination leaves
    /// uncovered takes a small, confidence-discounted prevalence nudge.
    /// Best-effort and explicitly approximate: the true blocking cause is
    /// not observable from a single failed connection.
    fn nudge_uncountered(&self, combination: &StrategyCombination) {
        let countered_categories: HashSet<&str> = self
            .catalog
            .enabled_detections()
            .iter()
            .filter(|method| {
                combination
                    .strategies
                    .iter()
                    .any(|id| method.counters(id))
            })
            .map(|method| method.category.as_str())
            .collect();

        let amount = DRIFT_NUDGE * DRIFT_CONFIDENCE;
        for method in self.catalog.enabled_detections() {
            if countered_categories.contains(method.category.as_str()) {
                continue;
            }
            let prevalence = method.nudge(amount, self.cap_samples);
            debug!(
                detection = %method.id,
                prevalence,
                "prevalence nudged after unattributed block"
            );
        }
    }

    fn remember(&self, outcome: &ConnectionOutcome) {
        // A poisoned buffer lock only costs trend data, never the report.
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == OUTCOME_WINDOW {
                recent.pop_front();
            }
            recent.push_back(OutcomeRecord {
                result: outcome.result,
                latency: outcome.latency,
                at: Utc::now(),
            });
        }
    }

    /// Fraction of recent outcomes that were blocks, if any were recorded
    pub fn recent_block_rate(&self) -> Option<f64> {
        let recent = self.recent.lock().ok()?;
        if recent.is_empty() {
            return None;
        }
        let blocked = recent
            .iter()
            .filter(|r| r.result == ConnectionResult::Blocked)
            .count();
        Some(blocked as f64 / recent.len() as f64)
    }

    /// Mean latency over recent outcomes, if any were recorded
    pub fn recent_mean_latency(&self) -> Option<Duration> {
        let recent = self.recent.lock().ok()?;
        if recent.is_empty() {
            return None;
        }
        let total: Duration = recent.iter().map(|r| r.latency).sum();
        Some(total / recent.len() as u32)
    }

    /// Timestamp of the oldest retained outcome
    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.recent.lock().ok()?.front().map(|r| r.at)
    }
}
