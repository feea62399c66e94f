//! Configuration management for the evasion engine
//!
//! Handles loading and saving the strategy/detection catalog and engine
//! settings from YAML files. A missing configuration file falls back to the
//! built-in catalog with a warning; a malformed file is a hard error.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::constants::{DEFAULT_CAP_SAMPLES, DEFAULT_OPTIMISM_BONUS};
use crate::modes::PerformanceMode;

/// Static definition of one obfuscation strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Stable identifier, kebab-case
    pub id: String,
    /// Technique family tag, e.g. "segmentation", "mimicry", "tls"
    pub category: String,
    /// Success-rate prior before any live evidence, in [0,1]
    pub baseline_prior: f64,
    /// Relative CPU/latency overhead unit
    pub performance_cost: f64,
    /// Strategies in the same group cannot be layered together
    #[serde(default)]
    pub exclusion_group: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Static definition of one inspection/detection method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSpec {
    pub id: String,
    pub category: String,
    /// Estimated deployment prevalence/effectiveness, in [0,1]
    pub baseline_prevalence: f64,
    /// Strategy ids known to reduce this method's effectiveness
    #[serde(default)]
    pub countered_by: Vec<String>,
}

/// Engine tuning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Active performance mode at startup
    #[serde(default)]
    pub mode: PerformanceMode,
    /// Sample-count cap for the moving-average score update
    #[serde(default = "default_cap_samples")]
    pub cap_samples: u32,
    /// Optimism bonus for under-sampled strategies
    #[serde(default = "default_optimism_bonus")]
    pub optimism_bonus: f64,
    /// Snapshot file used to warm-start scores, if present
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Whether to log to a rolling file in addition to stdout
    #[serde(default)]
    pub log_to_file: bool,
    /// Path to the log file (used when log_to_file is true)
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mode: PerformanceMode::default(),
            cap_samples: default_cap_samples(),
            optimism_bonus: default_optimism_bonus(),
            snapshot_path: None,
            log_level: default_log_level(),
            log_to_file: false,
            log_file_path: None,
        }
    }
}

/// Top-level configuration: catalog plus engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategySpec>,
    #[serde(default = "default_detection_methods")]
    pub detection_methods: Vec<DetectionSpec>,
    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_enabled() -> bool {
    true
}

fn default_cap_samples() -> u32 {
    DEFAULT_CAP_SAMPLES
}

fn default_optimism_bonus() -> f64 {
    DEFAULT_OPTIMISM_BONUS
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn spec(
    id: &str,
    category: &str,
    prior: f64,
    cost: f64,
    group: Option<&str>,
) -> StrategySpec {
    StrategySpec {
        id: id.to_string(),
        category: category.to_string(),
        baseline_prior: prior,
        performance_cost: cost,
        exclusion_group: group.map(str::to_string),
        enabled: true,
    }
}

fn detection(id: &str, category: &str, prevalence: f64, countered_by: &[&str]) -> DetectionSpec {
    DetectionSpec {
        id: id.to_string(),
        category: category.to_string(),
        baseline_prevalence: prevalence,
        countered_by: countered_by.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_strategies() -> Vec<StrategySpec> {
    vec![
        spec("tls-cipher-rotation", "tls", 0.92, 8.0, Some("tls-fingerprint")),
        spec("packet-segmentation", "segmentation", 0.88, 9.0, None),
        spec("traffic-mimicry", "mimicry", 0.85, 10.0, Some("http-behavior")),
        spec("protocol-obfuscation", "obfuscation", 0.89, 9.0, None),
        spec("timing-obfuscation", "timing", 0.81, 8.0, None),
        spec("sni-fragmentation", "tls", 0.87, 7.0, Some("sni")),
        spec("domain-fronting", "routing", 0.74, 6.0, Some("sni")),
        spec("entropy-maximization", "obfuscation", 0.83, 8.0, None),
        spec("header-randomization", "mimicry", 0.90, 3.0, Some("http-behavior")),
    ]
}

fn default_detection_methods() -> Vec<DetectionSpec> {
    vec![
        detection("sni-filtering", "sni", 0.92, &["sni-fragmentation", "domain-fronting"]),
        detection("tls-cert-pinning", "tls", 0.85, &["tls-cipher-rotation"]),
        detection(
            "packet-size-analysis",
            "statistical",
            0.90,
            &["packet-segmentation", "entropy-maximization"],
        ),
        detection("behavioral-analysis", "behavioral", 0.88, &["traffic-mimicry"]),
        detection("timing-correlation", "timing", 0.75, &["timing-obfuscation"]),
        detection(
            "header-inspection",
            "content",
            0.92,
            &["header-randomization", "traffic-mimicry"],
        ),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EngineConfig {
    /// Built-in catalog used when no configuration file exists
    pub fn builtin() -> Self {
        Self {
            strategies: default_strategies(),
            detection_methods: default_detection_methods(),
            engine: EngineSettings::default(),
        }
    }

    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                // Parse YAML, propagate parse errors instead of silently defaulting
                let config: EngineConfig = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!(
                        "Configuration file not found at '{}', using built-in catalog",
                        path.as_ref().display()
                    );
                    let config = Self::builtin();
                    config.validate()?;
                    Ok(config)
                } else {
                    Err(anyhow::anyhow!(
                        "Failed to read configuration file '{}': {}",
                        path.as_ref().display(),
                        e
                    ))
                }
            }
        }
    }

    /// Save configuration to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).await?;
        Ok(())
    }

    /// Validate configuration fields and cross-references
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.engine.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.engine.log_level));
        }

        if self.engine.cap_samples == 0 {
            return Err(anyhow::anyhow!("cap_samples must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.engine.optimism_bonus) {
            return Err(anyhow::anyhow!(
                "optimism_bonus must be within [0,1], got {}",
                self.engine.optimism_bonus
            ));
        }

        let mut strategy_ids = HashSet::new();
        for strategy in &self.strategies {
            if strategy.id.trim().is_empty() {
                return Err(anyhow::anyhow!("Strategy id cannot be empty"));
            }
            if strategy.category.trim().is_empty() {
                return Err(anyhow::anyhow!("Strategy '{}' has an empty category", strategy.id));
            }
            if !strategy_ids.insert(strategy.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate strategy id: {}", strategy.id));
            }
            if !(0.0..=1.0).contains(&strategy.baseline_prior) {
                return Err(anyhow::anyhow!(
                    "Strategy '{}' baseline_prior must be within [0,1], got {}",
                    strategy.id,
                    strategy.baseline_prior
                ));
            }
            if strategy.performance_cost <= 0.0 {
                return Err(anyhow::anyhow!(
                    "Strategy '{}' performance_cost must be positive, got {}",
                    strategy.id,
                    strategy.performance_cost
                ));
            }
            if let Some(group) = &strategy.exclusion_group {
                if group.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "Strategy '{}' has an empty exclusion_group",
                        strategy.id
                    ));
                }
            }
        }

        let mut detection_ids = HashSet::new();
        for method in &self.detection_methods {
            if method.id.trim().is_empty() {
                return Err(anyhow::anyhow!("Detection method id cannot be empty"));
            }
            if method.category.trim().is_empty() {
                return Err(anyhow::anyhow!("Detection method '{}' has an empty category", method.id));
            }
            if !detection_ids.insert(method.id.as_str()) {
                return Err(anyhow::anyhow!("Duplicate detection method id: {}", method.id));
            }
            if !(0.0..=1.0).contains(&method.baseline_prevalence) {
                return Err(anyhow::anyhow!(
                    "Detection method '{}' baseline_prevalence must be within [0,1], got {}",
                    method.id,
                    method.baseline_prevalence
                ));
            }
            for counter in &method.countered_by {
                if !strategy_ids.contains(counter.as_str()) {
                    return Err(anyhow::anyhow!(
                        "Detection method '{}' references unknown strategy '{}'",
                        method.id,
                        counter
                    ));
                }
            }
        }

        Ok(())
    }
}
