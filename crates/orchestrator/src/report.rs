//! Audit log of run summaries, kept as one JSON document.

use chrono::{DateTime, Utc};
use genbatch_core::{Outcome, RunResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub key: String,
    pub error: String,
}

/// A run reduced to what an audit needs. Per-task successes are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub owner_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub rounds: u32,
    pub attempted: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub claim_conflicts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    #[serde(default)]
    pub failures: Vec<FailureEntry>,
}

impl From<&RunResult> for RunSummary {
    fn from(result: &RunResult) -> Self {
        let failures = result
            .outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                Outcome::Failed { error } => Some(FailureEntry {
                    key: o.key.to_string(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect();

        Self {
            run_id: result.run_id,
            owner_id: result.scope.owner_id.clone(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms,
            rounds: result.rounds,
            attempted: result.attempted,
            generated: result.generated,
            skipped: result.skipped,
            failed: result.failed,
            claim_conflicts: result.claim_conflicts,
            aborted: result.aborted.clone(),
            failures,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLog {
    pub runs: Vec<RunSummary>,
}

impl ReportLog {
    /// Reads the log at `path`; a missing file is an empty log.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes through a sibling temp file so readers never see a partial document.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Appends one run and returns how many runs the log now holds.
    pub async fn append(path: &Path, result: &RunResult) -> Result<usize> {
        let mut log = Self::load(path).await?;
        log.runs.push(RunSummary::from(result));
        log.save(path).await?;
        debug!(path = %path.display(), runs = log.runs.len(), "Report appended");
        Ok(log.runs.len())
    }
}
