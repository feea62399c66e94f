//! Global tuning constants for the evasion engine

// ============================================================================
// SCOREBOARD
// ============================================================================

/// Default sample-count cap for the moving-average score update.
///
/// Below the cap the update behaves as a plain running mean; at the cap it
/// becomes an exponentially-weighted average so recent evidence keeps its
/// weight as the adversary drifts.
pub const DEFAULT_CAP_SAMPLES: u32 = 64;

/// Default optimism bonus added to the baseline prior of under-sampled
/// strategies so they earn trial opportunities.
pub const DEFAULT_OPTIMISM_BONUS: f64 = 0.15;

// ============================================================================
// ADVERSARY DRIFT
// ============================================================================

/// Raw prevalence nudge applied to detection methods left uncountered by a
/// blocked combination.
pub const DRIFT_NUDGE: f64 = 0.05;

/// Confidence discount on the drift nudge. The blocking cause is not directly
/// observable, so only half of the raw nudge is applied.
pub const DRIFT_CONFIDENCE: f64 = 0.5;

// ============================================================================
// OUTCOME HISTORY
// ============================================================================

/// Ring-buffer capacity for recent connection outcomes (trend detection).
pub const OUTCOME_WINDOW: usize = 256;

// ============================================================================
// ALERTING
// ============================================================================

/// Consecutive selection failures before catalog exhaustion escalates to an
/// operator-visible alert.
pub const EXHAUSTION_ALERT_THRESHOLD: u32 = 25;
