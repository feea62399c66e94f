//! Joint detection-risk estimation
//!
//! Models the chance that at least one enabled detection method catches a
//! connection carrying a given strategy combination. Each method contributes
//! independently (noisy-OR); a method is silenced entirely when any member of
//! the combination counters it, so stacking redundant counters against the
//! same vector buys nothing while covering a second vector always helps.

use std::sync::Arc;

use crate::catalog::Catalog;

/// Estimates joint detection risk for candidate combinations
#[derive(Debug, Clone)]
pub struct RiskEstimator {
    catalog: Arc<Catalog>,
}

impl RiskEstimator {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Probability in [0,1] that the combination is detected.
    ///
    /// An empty member list yields the noisy-OR of raw prevalences: no
    /// mitigation at all.
    pub fn estimate(&self, member_ids: &[String]) -> f64 {
        let mut evade_all = 1.0;
        for method in self.catalog.enabled_detections() {
            let countered = member_ids.iter().any(|id| method.counters(id));
            if countered {
                continue;
            }
            let (prevalence, _) = method.prevalence_estimate();
            evade_all *= 1.0 - prevalence;
        }
        (1.0 - evade_all).clamp(0.0, 1.0)
    }
}
