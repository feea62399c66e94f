//! Engine facade
//!
//! Wires the catalog, risk estimator, selector and feedback processor into
//! the per-connection API consumed by the transport layer: pick a
//! combination, execute it elsewhere, report what happened. The engine also
//! owns the atomically-swappable current mode and the aggregate attempt
//! counters, and escalates persistent catalog exhaustion to an
//! operator-visible alert.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::config::{EngineConfig, EngineSettings};
use crate::constants::EXHAUSTION_ALERT_THRESHOLD;
use crate::feedback::{ConnectionOutcome, ConnectionResult, FeedbackProcessor};
use crate::modes::PerformanceMode;
use crate::selection::{SelectError, Selector, StrategyCombination};
use crate::snapshot::ScoreSnapshot;

/// Aggregate connection counters, updated lock-free
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total_attempts: AtomicU64,
    successes: AtomicU64,
    blocked: AtomicU64,
    degraded: AtomicU64,
    timed_out: AtomicU64,
    exhausted_selects: AtomicU64,
}

/// Plain-data view of the counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_attempts: u64,
    pub successes: u64,
    pub blocked: u64,
    pub degraded: u64,
    pub timed_out: u64,
    pub exhausted_selects: u64,
    pub success_rate: f64,
}

impl EngineMetrics {
    fn record(&self, result: ConnectionResult) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            ConnectionResult::Success => &self.successes,
            ConnectionResult::Blocked => &self.blocked,
            ConnectionResult::Degraded => &self.degraded,
            ConnectionResult::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let total = self.total_attempts.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        MetricsSummary {
            total_attempts: total,
            successes,
            blocked: self.blocked.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            exhausted_selects: self.exhausted_selects.load(Ordering::Relaxed),
            success_rate: if total > 0 { successes as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Adaptive strategy-selection engine
pub struct EvasionEngine {
    catalog: Arc<Catalog>,
    selector: Selector,
    feedback: FeedbackProcessor,
    mode: AtomicU8,
    exhausted_streak: AtomicU32,
    pub metrics: EngineMetrics,
}

impl EvasionEngine {
    /// Build the engine from validated configuration
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let catalog = Arc::new(Catalog::from_specs(&config.strategies, &config.detection_methods));
        Ok(Self::with_catalog(catalog, &config.engine))
    }

    /// Build the engine around an existing catalog
    pub fn with_catalog(catalog: Arc<Catalog>, settings: &EngineSettings) -> Self {
        info!(
            strategies = catalog.strategy_count(),
            detections = catalog.detection_count(),
            mode = %settings.mode,
            "evasion engine initialized"
        );
        Self {
            selector: Selector::new(Arc::clone(&catalog), settings.optimism_bonus),
            feedback: FeedbackProcessor::new(Arc::clone(&catalog), settings.cap_samples),
            catalog,
            mode: AtomicU8::new(settings.mode.as_u8()),
            exhausted_streak: AtomicU32::new(0),
            metrics: EngineMetrics::default(),
        }
    }

    /// Pick a combination for one connection attempt under the current mode
    pub fn select(&self) -> Result<StrategyCombination, SelectError> {
        self.select_with(self.mode())
    }

    /// Pick a combination under an explicit mode
    pub fn select_with(&self, mode: PerformanceMode) -> Result<StrategyCombination, SelectError> {
        match self.selector.select(&mode.constraints()) {
            Ok(combination) => {
                self.exhausted_streak.store(0, Ordering::Relaxed);
                debug!(combination = %combination, mode = %mode, "combination selected");
                Ok(combination)
            }
            Err(err) => {
                self.metrics.exhausted_selects.fetch_add(1, Ordering::Relaxed);
                let streak = self.exhausted_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak == EXHAUSTION_ALERT_THRESHOLD {
                    error!(
                        streak,
                        "catalog exhausted for {} consecutive selections, operator attention required",
                        streak
                    );
                } else {
                    warn!(streak, "no enabled strategy available, caller should fall back to direct connection");
                }
                Err(err)
            }
        }
    }

    /// Report one connection outcome. Best-effort: never fails the caller.
    pub fn report(&self, combination: &StrategyCombination, outcome: ConnectionOutcome) {
        self.metrics.record(outcome.result);
        self.feedback.report(combination, &outcome);
    }

    /// Point-in-time view of all current scores; does not block selection or
    /// feedback
    pub fn snapshot(&self) -> ScoreSnapshot {
        self.catalog.snapshot()
    }

    /// Apply a saved snapshot over baseline priors; returns entries applied
    pub fn warm_start(&self, snapshot: &ScoreSnapshot) -> usize {
        let applied = self.catalog.warm_start(snapshot);
        info!(applied, taken_at = %snapshot.taken_at, "scoreboard warm-started from snapshot");
        applied
    }

    /// Switch the mode for all subsequent selections. In-flight connections
    /// keep the combination chosen at selection time.
    pub fn set_mode(&self, mode: PerformanceMode) {
        self.mode.store(mode.as_u8(), Ordering::Release);
        info!(mode = %mode, "performance mode switched");
    }

    pub fn mode(&self) -> PerformanceMode {
        PerformanceMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Fraction of recent outcomes that were blocks, for trend watching
    pub fn recent_block_rate(&self) -> Option<f64> {
        self.feedback.recent_block_rate()
    }

    /// Mean latency over recent outcomes
    pub fn recent_mean_latency(&self) -> Option<std::time::Duration> {
        self.feedback.recent_mean_latency()
    }
}
