//! Point-in-time score snapshots
//!
//! A snapshot is a flat table of every catalog record's live score, taken
//! without blocking ongoing selection or feedback. Snapshots serialize to
//! YAML and can be reloaded at startup to warm-start the catalog instead of
//! falling back to cold baseline priors.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Which catalog table a snapshot entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Strategy,
    Detection,
}

/// One catalog record's score at snapshot time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub id: String,
    pub kind: RecordKind,
    /// Success estimate for strategies, prevalence estimate for detections
    pub current_estimate: f64,
    pub sample_count: u32,
    /// Absent when the record was never touched after load
    pub last_updated: Option<DateTime<Utc>>,
}

/// Serializable view of all current scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<ScoreEntry>,
}

impl ScoreSnapshot {
    /// Find an entry by record id
    pub fn entry(&self, id: &str) -> Option<&ScoreEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Number of entries of the given kind
    pub fn count(&self, kind: RecordKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Save the snapshot to a YAML file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("Failed to create snapshot directory '{}'", parent.display())
                })?;
            }
        }
        fs::write(&path, yaml).await.with_context(|| {
            format!("Failed to write snapshot file '{}'", path.as_ref().display())
        })?;
        Ok(())
    }

    /// Load a snapshot from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(&path).await.with_context(|| {
            format!("Failed to read snapshot file '{}'", path.as_ref().display())
        })?;
        let snapshot: ScoreSnapshot = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse snapshot YAML: {}", e))?;
        Ok(snapshot)
    }
}
