//! Performance modes and their selection constraints
//!
//! A performance mode names a trade-off between evasion thoroughness and
//! overhead. The mode maps to a fixed constraint set consumed by the
//! selection engine; there is no state machine behind it.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Named trade-off profile between evasion thoroughness and overhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    /// Minimal layering, cheap combinations, little exploration
    Speed,
    /// Default middle ground
    Balanced,
    /// Maximal risk reduction regardless of cost
    Quality,
}

/// Error for unrecognized mode names
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid performance mode: {0} (expected speed, balanced or quality)")]
pub struct ParseModeError(String);

/// Constraint set a mode imposes on the selection engine
#[derive(Debug, Clone, PartialEq)]
pub struct ModeConstraints {
    /// Maximum number of strategies layered onto one connection
    pub max_layers: usize,
    /// Probability of a pure-exploration selection pass
    pub exploration_rate: f64,
    /// Observations below which a strategy scores with its optimistic prior
    pub min_confidence_samples: u32,
    /// Weight of aggregate performance cost in the utility score (λ)
    pub cost_weight: f64,
    /// Connection timeout budget handed to the transport collaborator
    pub timeout_budget: Duration,
}

impl PerformanceMode {
    /// Look up the constraint set for this mode
    pub fn constraints(self) -> ModeConstraints {
        match self {
            PerformanceMode::Speed => ModeConstraints {
                max_layers: 1,
                exploration_rate: 0.02,
                min_confidence_samples: 20,
                cost_weight: 0.05,
                timeout_budget: Duration::from_secs(5),
            },
            PerformanceMode::Balanced => ModeConstraints {
                max_layers: 3,
                exploration_rate: 0.08,
                min_confidence_samples: 10,
                cost_weight: 0.015,
                timeout_budget: Duration::from_secs(15),
            },
            PerformanceMode::Quality => ModeConstraints {
                max_layers: 5,
                exploration_rate: 0.15,
                min_confidence_samples: 5,
                cost_weight: 0.004,
                timeout_budget: Duration::from_secs(30),
            },
        }
    }

    /// Canonical lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceMode::Speed => "speed",
            PerformanceMode::Balanced => "balanced",
            PerformanceMode::Quality => "quality",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PerformanceMode::Speed => 0,
            PerformanceMode::Balanced => 1,
            PerformanceMode::Quality => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => PerformanceMode::Speed,
            2 => PerformanceMode::Quality,
            _ => PerformanceMode::Balanced,
        }
    }
}

impl Default for PerformanceMode {
    fn default() -> Self {
        PerformanceMode::Balanced
    }
}

impl FromStr for PerformanceMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "speed" => Ok(PerformanceMode::Speed),
            "balanced" => Ok(PerformanceMode::Balanced),
            "quality" => Ok(PerformanceMode::Quality),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

impl std::fmt::Display for PerformanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_constraint_table() {
        let speed = PerformanceMode::Speed.constraints();
        let balanced = PerformanceMode::Balanced.constraints();
        let quality = PerformanceMode::Quality.constraints();

        assert_eq!(speed.max_layers, 1);
        assert_eq!(balanced.max_layers, 3);
        assert_eq!(quality.max_layers, 5);

        // Exploration widens as the mode gets more thorough
        assert!(speed.exploration_rate < balanced.exploration_rate);
        assert!(balanced.exploration_rate < quality.exploration_rate);

        // Cost weight shrinks as the mode gets more thorough
        assert!(speed.cost_weight > balanced.cost_weight);
        assert!(balanced.cost_weight > quality.cost_weight);

        // Confidence requirements relax as exploration widens
        assert!(speed.min_confidence_samples > balanced.min_confidence_samples);
        assert!(balanced.min_confidence_samples > quality.min_confidence_samples);

        // Timeout budget grows with thoroughness
        assert!(speed.timeout_budget < balanced.timeout_budget);
        assert!(balanced.timeout_budget < quality.timeout_budget);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("speed".parse::<PerformanceMode>(), Ok(PerformanceMode::Speed));
        assert_eq!("Balanced".parse::<PerformanceMode>(), Ok(PerformanceMode::Balanced));
        assert_eq!("QUALITY".parse::<PerformanceMode>(), Ok(PerformanceMode::Quality));
        assert!("turbo".parse::<PerformanceMode>().is_err());
    }

    #[test]
    fn test_mode_default_is_balanced() {
        assert_eq!(PerformanceMode::default(), PerformanceMode::Balanced);
    }

    #[test]
    fn test_mode_u8_roundtrip() {
        for mode in [PerformanceMode::Speed, PerformanceMode::Balanced, PerformanceMode::Quality] {
            assert_eq!(PerformanceMode::from_u8(mode.as_u8()), mode);
        }
        // Unknown values fall back to the default mode
        assert_eq!(PerformanceMode::from_u8(99), PerformanceMode::Balanced);
    }

    #[test]
    fn test_mode_serde_names() {
        let yaml = serde_yaml::to_string(&PerformanceMode::Quality).unwrap();
        assert_eq!(yaml.trim(), "quality");
        let parsed: PerformanceMode = serde_yaml::from_str("speed").unwrap();
        assert_eq!(parsed, PerformanceMode::Speed);
    }
}
