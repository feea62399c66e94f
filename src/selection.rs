//! Strategy combination selection
//!
//! Chooses which obfuscation strategies to layer onto one outbound
//! connection, balancing estimated detection risk against performance cost
//! under the active mode's constraints. Valid combinations are walked by a
//! lazy depth-first generator that respects mutual-exclusion groups and the
//! layer cap, so the subset space is never materialized. Exploration picks a
//! uniformly random valid combination via reservoir sampling over the same
//! walk.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::catalog::{Catalog, StrategyRecord};
use crate::modes::ModeConstraints;
use crate::risk::RiskEstimator;

/// Errors surfaced to the caller of `select`
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    /// Every strategy in the catalog is disabled. The caller may fall back
    /// to a direct, unobfuscated connection.
    #[error("no enabled strategy available")]
    NoStrategyAvailable,
}

/// Ordered set of strategies applied together to one connection attempt.
///
/// Members are kept in lexicographic id order (outer layer first); no two
/// members share an exclusion group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyCombination {
    pub strategies: Vec<String>,
    /// Summed performance cost of all members
    pub aggregate_cost: f64,
    /// Joint detection risk estimated at selection time
    pub estimated_risk: f64,
}

impl StrategyCombination {
    pub fn layer_count(&self) -> usize {
        self.strategies.len()
    }
}

impl fmt::Display for StrategyCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.strategies.join("+"))
    }
}

struct Candidate<'a> {
    record: &'a StrategyRecord,
    /// Live estimate, or the optimism-inflated prior while under-sampled
    effective_estimate: f64,
}

/// Lazy depth-first walk over valid member index sets, in lexicographic
/// order. Yields every nonempty subset of the candidate slice that respects
/// the layer cap and mutual-exclusion groups.
struct Combinations<'a, 'b> {
    candidates: &'b [Candidate<'a>],
    max_layers: usize,
    stack: Vec<usize>,
    cursor: usize,
}

impl<'a, 'b> Combinations<'a, 'b> {
    fn new(candidates: &'b [Candidate<'a>], max_layers: usize) -> Self {
        Self { candidates, max_layers, stack: Vec::new(), cursor: 0 }
    }

    fn compatible(&self, index: usize) -> bool {
        match &self.candidates[index].record.exclusion_group {
            None => true,
            Some(group) => !self.stack.iter().any(|&i| {
                self.candidates[i].record.exclusion_group.as_deref() == Some(group.as_str())
            }),
        }
    }
}

impl Iterator for Combinations<'_, '_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.max_layers == 0 {
            return None;
        }
        loop {
            if self.stack.len() < self.max_layers {
                while self.cursor < self.candidates.len() {
                    if self.compatible(self.cursor) {
                        self.stack.push(self.cursor);
                        self.cursor += 1;
                        return Some(self.stack.clone());
                    }
                    self.cursor += 1;
                }
            }
            match self.stack.pop() {
                Some(last) => self.cursor = last + 1,
                None => return None,
            }
        }
    }
}

struct Scored {
    members: Vec<usize>,
    ids: Vec<String>,
    cost: f64,
    risk: f64,
    utility: f64,
}

impl Scored {
    /// Tie-break order: higher utility, then fewer layers, then the
    /// lexicographically smallest id sequence
    fn beats(&self, other: &Scored) -> bool {
        if self.utility != other.utility {
            return self.utility > other.utility;
        }
        if self.ids.len() != other.ids.len() {
            return self.ids.len() < other.ids.len();
        }
        self.ids < other.ids
    }
}

/// Per-connection strategy combination chooser
pub struct Selector {
    catalog: Arc<Catalog>,
    estimator: RiskEstimator,
    optimism_bonus: f64,
}

impl Selector {
    pub fn new(catalog: Arc<Catalog>, optimism_bonus: f64) -> Self {
        let estimator = RiskEstimator::new(Arc::clone(&catalog));
        Self { catalog, estimator, optimism_bonus }
    }

    /// Pick a combination for one connection attempt.
    ///
    /// Stateless beyond catalog reads; never blocks on I/O.
    pub fn select(&self, constraints: &ModeConstraints) -> Result<StrategyCombination, SelectError> {
        self.select_with_rng(constraints, &mut rand::thread_rng())
    }

    pub(crate) fn select_with_rng<R: Rng>(
        &self,
        constraints: &ModeConstraints,
        rng: &mut R,
    ) -> Result<StrategyCombination, SelectError> {
        let enabled = self.catalog.enabled_strategies(None);
        if enabled.is_empty() {
            return Err(SelectError::NoStrategyAvailable);
        }

        let candidates: Vec<Candidate> = enabled
            .into_iter()
            .map(|record| Candidate {
                effective_estimate: self.effective_estimate(record, constraints),
                record,
            })
            .collect();

        // The exploration coin is drawn up front so the walk below feeds both
        // the exploit ranking and the uniform reservoir in a single pass.
        let explore = rng.gen::<f64>() < constraints.exploration_rate;

        let mut best: Option<Scored> = None;
        let mut reservoir: Option<Vec<usize>> = None;
        let mut seen = 0usize;
        for members in Combinations::new(&candidates, constraints.max_layers) {
            seen += 1;
            if rng.gen_range(0..seen) == 0 {
                reservoir = Some(members.clone());
            }
            let scored = self.score(&candidates, members, constraints);
            if best.as_ref().map_or(true, |current| scored.beats(current)) {
                best = Some(scored);
            }
        }

        let chosen = if explore {
            reservoir.map(|members| self.score(&candidates, members, constraints))
        } else {
            best
        };

        match chosen {
            Some(scored) => Ok(self.finalize(scored, &candidates, constraints)),
            // Unreachable with a nonempty candidate list: every single
            // strategy is itself a valid combination.
            None => Err(SelectError::NoStrategyAvailable),
        }
    }

    /// Live estimate once enough samples exist, otherwise the baseline prior
    /// inflated by an optimism bonus that decays as evidence accumulates
    fn effective_estimate(&self, record: &StrategyRecord, constraints: &ModeConstraints) -> f64 {
        let (estimate, samples) = record.success_estimate();
        if samples < constraints.min_confidence_samples {
            let uncertainty = 1.0 - f64::from(samples) / f64::from(constraints.min_confidence_samples);
            (record.baseline_prior + self.optimism_bonus * uncertainty).min(1.0)
        } else {
            estimate
        }
    }

    fn score(&self, candidates: &[Candidate], members: Vec<usize>, constraints: &ModeConstraints) -> Scored {
        let ids: Vec<String> = members.iter().map(|&i| candidates[i].record.id.clone()).collect();
        let cost: f64 = members.iter().map(|&i| candidates[i].record.performance_cost).sum();
        let risk = self.estimator.estimate(&ids);
        let mean_estimate = members
            .iter()
            .map(|&i| candidates[i].effective_estimate)
            .sum::<f64>()
            / members.len() as f64;
        let estimated_success = (1.0 - risk) * mean_estimate;
        let utility = estimated_success - constraints.cost_weight * cost;
        Scored { members, ids, cost, risk, utility }
    }

    /// Final invariant gate. A violation here is a bug in the walk; debug
    /// builds fail fast, release builds degrade to the best single strategy.
    fn finalize(
        &self,
        scored: Scored,
        candidates: &[Candidate],
        constraints: &ModeConstraints,
    ) -> StrategyCombination {
        if combination_is_valid(candidates, &scored.members, constraints.max_layers) {
            return StrategyCombination {
                strategies: scored.ids,
                aggregate_cost: scored.cost,
                estimated_risk: scored.risk,
            };
        }

        debug_assert!(false, "combination walk produced an invalid member set: {:?}", scored.ids);
        warn!(combination = ?scored.ids, "invalid combination produced, degrading to single strategy");

        let mut fallback: Option<Scored> = None;
        for index in 0..candidates.len() {
            let single = self.score(candidates, vec![index], constraints);
            if fallback.as_ref().map_or(true, |current| single.beats(current)) {
                fallback = Some(single);
            }
        }
        // A candidate list is never empty here; any single strategy is valid.
        let scored = fallback.unwrap_or(Scored {
            members: Vec::new(),
            ids: Vec::new(),
            cost: 0.0,
            risk: 1.0,
            utility: 0.0,
        });
        StrategyCombination {
            strategies: scored.ids,
            aggregate_cost: scored.cost,
            estimated_risk: scored.risk,
        }
    }
}

fn combination_is_valid(candidates: &[Candidate], members: &[usize], max_layers: usize) -> bool {
    if members.is_empty() || members.len() > max_layers {
        return false;
    }
    for (position, &index) in members.iter().enumerate() {
        let record = candidates[index].record;
        if !record.is_enabled() {
            return false;
        }
        if let Some(group) = &record.exclusion_group {
            let shared = members[position + 1..].iter().any(|&other| {
                candidates[other].record.exclusion_group.as_deref() == Some(group.as_str())
            });
            if shared {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionSpec, EngineConfig, StrategySpec};
    use crate::constants::DEFAULT_OPTIMISM_BONUS;
    use crate::modes::PerformanceMode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn strategy(id: &str, prior: f64, cost: f64, group: Option<&str>) -> StrategySpec {
        StrategySpec {
            id: id.to_string(),
            category: "generic".to_string(),
            baseline_prior: prior,
            performance_cost: cost,
            exclusion_group: group.map(str::to_string),
            enabled: true,
        }
    }

    fn detection(id: &str, prevalence: f64, countered_by: &[&str]) -> DetectionSpec {
        DetectionSpec {
            id: id.to_string(),
            category: "generic".to_string(),
            baseline_prevalence: prevalence,
            countered_by: countered_by.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn selector(strategies: &[StrategySpec], detections: &[DetectionSpec]) -> (Arc<Catalog>, Selector) {
        let catalog = Arc::new(Catalog::from_specs(strategies, detections));
        let selector = Selector::new(Arc::clone(&catalog), DEFAULT_OPTIMISM_BONUS);
        (catalog, selector)
    }

    /// Deterministic constraints: exploit-only, for tests that assert the
    /// exact ranking outcome
    fn exploit_constraints(max_layers: usize, min_samples: u32, cost_weight: f64) -> ModeConstraints {
        ModeConstraints {
            max_layers,
            exploration_rate: 0.0,
            min_confidence_samples: min_samples,
            cost_weight,
            timeout_budget: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_no_strategy_available() {
        let (catalog, selector) = selector(&[strategy("a", 0.8, 1.0, None)], &[]);
        catalog.set_strategy_enabled("a", false).unwrap();
        assert_eq!(
            selector.select(&exploit_constraints(3, 10, 0.01)),
            Err(SelectError::NoStrategyAvailable)
        );
    }

    #[test]
    fn test_single_strategy_catalog_speed_mode() {
        // One strategy, one uncounterable detection method: the lone strategy
        // is still worth using when the cost penalty stays under its success
        // contribution.
        let (_, selector) = selector(
            &[strategy("tls-cipher-rotation", 0.92, 1.0, None)],
            &[detection("sni-filtering", 0.9, &[])],
        );
        let combination = selector
            .select(&PerformanceMode::Speed.constraints())
            .unwrap();
        assert_eq!(combination.strategies, vec!["tls-cipher-rotation".to_string()]);
        assert_eq!(combination.layer_count(), 1);
        assert!((combination.estimated_risk - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_mutual_exclusion_never_violated() {
        let (_, selector) = selector(
            &[
                strategy("frag-a", 0.9, 1.0, Some("sni")),
                strategy("frag-b", 0.9, 1.0, Some("sni")),
                strategy("other", 0.9, 1.0, None),
            ],
            &[
                detection("d1", 0.9, &["frag-a"]),
                detection("d2", 0.9, &["frag-b"]),
                detection("d3", 0.9, &["other"]),
            ],
        );
        let constraints = exploit_constraints(3, 10, 0.001);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let combination = selector.select_with_rng(&constraints, &mut rng).unwrap();
            let members: Vec<&str> = combination.strategies.iter().map(String::as_str).collect();
            let both = members.contains(&"frag-a") && members.contains(&"frag-b");
            assert!(!both, "exclusion group violated: {:?}", members);
        }
    }

    #[test]
    fn test_layer_cap_respected() {
        let specs: Vec<StrategySpec> = (0..6)
            .map(|i| strategy(&format!("s{}", i), 0.9, 1.0, None))
            .collect();
        let detections: Vec<DetectionSpec> = (0..6)
            .map(|i| detection(&format!("d{}", i), 0.9, &[&format!("s{}", i)]))
            .collect();
        let (_, selector) = selector(&specs, &detections);
        for max_layers in 1..=4 {
            let combination = selector
                .select(&exploit_constraints(max_layers, 10, 0.0001))
                .unwrap();
            assert!(combination.layer_count() <= max_layers);
        }
    }

    #[test]
    fn test_tie_break_prefers_fewer_layers_then_lexicographic() {
        // No detections and zero cost weight: every combination scores the
        // same mean-estimate utility, so ranking falls through to the
        // structural tie-breaks.
        let (_, selector) = selector(
            &[
                strategy("bravo", 0.8, 1.0, None),
                strategy("alpha", 0.8, 1.0, None),
            ],
            &[],
        );
        let combination = selector.select(&exploit_constraints(2, 0, 0.0)).unwrap();
        assert_eq!(combination.strategies, vec!["alpha".to_string()]);
    }

    #[test]
    fn test_cold_start_gets_trial_opportunity() {
        // "fresh" has no samples; "proven-bad" has converged to failure.
        // Optimism must give the untested strategy its chance.
        let (catalog, selector) = selector(
            &[
                strategy("fresh", 0.8, 1.0, None),
                strategy("proven-bad", 0.8, 1.0, None),
            ],
            &[],
        );
        let bad = catalog.strategy("proven-bad").unwrap();
        for _ in 0..20 {
            bad.observe(0.0, 64);
        }
        let combination = selector.select(&exploit_constraints(1, 10, 0.01)).unwrap();
        assert_eq!(combination.strategies, vec!["fresh".to_string()]);
    }

    #[test]
    fn test_optimism_does_not_outlive_evidence() {
        // Once the formerly-fresh strategy has accumulated enough failures,
        // a proven performer of equal prior must win pure-utility ranking.
        let (catalog, selector) = selector(
            &[
                strategy("former-fresh", 0.8, 1.0, None),
                strategy("proven-good", 0.8, 1.0, None),
            ],
            &[],
        );
        let fresh = catalog.strategy("former-fresh").unwrap();
        let good = catalog.strategy("proven-good").unwrap();
        for _ in 0..20 {
            fresh.observe(0.0, 64);
            good.observe(1.0, 64);
        }
        let combination = selector.select(&exploit_constraints(1, 10, 0.01)).unwrap();
        assert_eq!(combination.strategies, vec!["proven-good".to_string()]);
    }

    #[test]
    fn test_blocked_strategy_loses_to_unblemished_alternative() {
        // Scenario: a 0.85-prior strategy takes 100 blocks; a 0.70-prior
        // alternative with a clean record must be preferred afterwards.
        let (catalog, selector) = selector(
            &[
                strategy("battered", 0.85, 1.0, None),
                strategy("modest", 0.70, 1.0, None),
            ],
            &[],
        );
        let battered = catalog.strategy("battered").unwrap();
        let modest = catalog.strategy("modest").unwrap();
        for _ in 0..100 {
            battered.observe(0.0, 64);
        }
        let (estimate, _) = battered.success_estimate();
        assert!(estimate < 0.3, "estimate {} did not collapse", estimate);

        // Give the alternative enough clean samples to rank on evidence.
        for _ in 0..10 {
            modest.observe(1.0, 64);
        }

        let constraints = PerformanceMode::Balanced.constraints();
        let deterministic = exploit_constraints(
            constraints.max_layers,
            constraints.min_confidence_samples,
            constraints.cost_weight,
        );
        let combination = selector.select(&deterministic).unwrap();
        assert_eq!(combination.strategies[0], "modest");
        assert!(!combination.strategies.contains(&"battered".to_string()));
    }

    #[test]
    fn test_mode_monotonicity_of_layer_count() {
        let config = EngineConfig::builtin();
        let catalog = Arc::new(Catalog::from_specs(&config.strategies, &config.detection_methods));
        let selector = Selector::new(Arc::clone(&catalog), DEFAULT_OPTIMISM_BONUS);

        let mut mean_layers = Vec::new();
        for mode in [PerformanceMode::Speed, PerformanceMode::Balanced, PerformanceMode::Quality] {
            let constraints = mode.constraints();
            let mut rng = StdRng::seed_from_u64(7);
            let total: usize = (0..300)
                .map(|_| {
                    selector
                        .select_with_rng(&constraints, &mut rng)
                        .map(|c| c.layer_count())
                        .unwrap_or(0)
                })
                .sum();
            mean_layers.push(total as f64 / 300.0);
        }
        assert!(
            mean_layers[2] >= mean_layers[1] && mean_layers[1] >= mean_layers[0],
            "layer means not monotone: {:?}",
            mean_layers
        );
    }

    #[test]
    fn test_exploration_returns_valid_combinations() {
        let (_, selector) = selector(
            &[
                strategy("a", 0.9, 1.0, Some("g")),
                strategy("b", 0.9, 1.0, Some("g")),
                strategy("c", 0.9, 1.0, None),
            ],
            &[],
        );
        // Exploration on every call: still never an invalid combination.
        let constraints = ModeConstraints {
            max_layers: 3,
            exploration_rate: 1.0,
            min_confidence_samples: 10,
            cost_weight: 0.01,
            timeout_budget: Duration::from_secs(10),
        };
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen_lengths = std::collections::HashSet::new();
        for _ in 0..200 {
            let combination = selector.select_with_rng(&constraints, &mut rng).unwrap();
            assert!(!combination.strategies.is_empty());
            assert!(combination.layer_count() <= 3);
            let both = combination.strategies.contains(&"a".to_string())
                && combination.strategies.contains(&"b".to_string());
            assert!(!both);
            seen_lengths.insert(combination.layer_count());
        }
        // Uniform sampling over the subset space actually varies its picks.
        assert!(seen_lengths.len() > 1);
    }

    #[test]
    fn test_combination_walk_enumerates_lexicographically() {
        let specs = [
            strategy("a", 0.9, 1.0, None),
            strategy("b", 0.9, 1.0, None),
            strategy("c", 0.9, 1.0, None),
        ];
        let catalog = Catalog::from_specs(&specs, &[]);
        let enabled = catalog.enabled_strategies(None);
        let candidates: Vec<Candidate> = enabled
            .into_iter()
            .map(|record| Candidate { record, effective_estimate: 0.9 })
            .collect();

        let walked: Vec<Vec<usize>> = Combinations::new(&candidates, 2).collect();
        assert_eq!(
            walked,
            vec![
                vec![0],
                vec![0, 1],
                vec![0, 2],
                vec![1],
                vec![1, 2],
                vec![2],
            ]
        );
    }

    #[test]
    fn test_combination_walk_skips_excluded_pairs() {
        let specs = [
            strategy("a", 0.9, 1.0, Some("g")),
            strategy("b", 0.9, 1.0, Some("g")),
        ];
        let catalog = Catalog::from_specs(&specs, &[]);
        let enabled = catalog.enabled_strategies(None);
        let candidates: Vec<Candidate> = enabled
            .into_iter()
            .map(|record| Candidate { record, effective_estimate: 0.9 })
            .collect();
        let walked: Vec<Vec<usize>> = Combinations::new(&candidates, 2).collect();
        assert_eq!(walked, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_utility_rewards_covering_detection_vectors() {
        let (_, selector) = selector(
            &[
                strategy("counter-one", 0.9, 2.0, None),
                strategy("counter-two", 0.9, 2.0, None),
            ],
            &[
                detection("vector-one", 0.9, &["counter-one"]),
                detection("vector-two", 0.9, &["counter-two"]),
            ],
        );
        let combination = selector.select(&exploit_constraints(2, 10, 0.001)).unwrap();
        assert_eq!(
            combination.strategies,
            vec!["counter-one".to_string(), "counter-two".to_string()]
        );
        assert!(combination.estimated_risk < 1e-9);
        assert!((combination.aggregate_cost - 4.0).abs() < 1e-9);
    }
}
