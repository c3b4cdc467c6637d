use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{Scope, TaskKey};

/// How a single dispatched task resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Generated,
    Skipped { reason: String },
    Failed { error: String },
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub key: TaskKey,
    pub outcome: Outcome,
    pub elapsed_ms: u64,
}

/// Metadata recorded with a completed task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMeta {
    pub content_chars: usize,
    pub model: Option<String>,
    pub elapsed_ms: u64,
}

/// Summary of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub rounds: u32,
    pub attempted: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Claims lost to another runner; not errors.
    pub claim_conflicts: usize,
    /// Set when a round-level store failure stopped the run.
    pub aborted: Option<String>,
    pub outcomes: Vec<TaskOutcome>,
}

impl RunResult {
    pub fn new(run_id: Uuid, scope: Scope) -> Self {
        Self {
            run_id,
            scope,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            rounds: 0,
            attempted: 0,
            generated: 0,
            skipped: 0,
            failed: 0,
            claim_conflicts: 0,
            aborted: None,
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: TaskOutcome) {
        self.attempted += 1;
        match outcome.outcome {
            Outcome::Generated => self.generated += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn record_conflict(&mut self) {
        self.claim_conflicts += 1;
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.aborted = Some(reason.into());
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(outcome: Outcome) -> TaskOutcome {
        TaskOutcome {
            task_id: Uuid::new_v4(),
            key: TaskKey::new("s", "v", "en"),
            outcome,
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_record_keeps_counters_distinct() {
        let mut result = RunResult::new(Uuid::new_v4(), Scope::new("o"));

        result.record(outcome(Outcome::Generated));
        result.record(outcome(Outcome::Generated));
        result.record(outcome(Outcome::Skipped {
            reason: "no content".to_string(),
        }));
        result.record(outcome(Outcome::Failed {
            error: "boom".to_string(),
        }));
        result.record_conflict();

        assert_eq!(result.attempted, 4);
        assert_eq!(result.generated, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.claim_conflicts, 1);
        assert_eq!(result.failures().count(), 1);
    }

    #[test]
    fn test_abort_marks_unsuccessful() {
        let mut result = RunResult::new(Uuid::new_v4(), Scope::new("o"));
        assert!(result.is_success());

        result.abort("store unavailable");
        result.finish();

        assert!(!result.is_success());
        assert!(result.finished_at.is_some());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(Outcome::Failed {
            error: "timeout".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["error"], "timeout");
    }
}
