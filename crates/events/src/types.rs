//! Event types published during runs and monitoring

use chrono::{DateTime, Utc};
use genbatch_core::JobStats;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run events
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: Uuid,
        owner_id: String,
        languages: Vec<String>,
        max_concurrent: usize,
    },

    #[serde(rename = "run.round_started")]
    RoundStarted { run_id: Uuid, round: u32, batch: usize },

    #[serde(rename = "run.round_finished")]
    RoundFinished {
        run_id: Uuid,
        round: u32,
        generated: u64,
        skipped: u64,
        failed: u64,
    },

    #[serde(rename = "run.finished")]
    RunFinished {
        run_id: Uuid,
        attempted: u64,
        generated: u64,
        skipped: u64,
        failed: u64,
        duration_ms: u64,
        aborted: Option<String>,
    },

    // Task events
    #[serde(rename = "task.claimed")]
    TaskClaimed { run_id: Uuid, task_id: Uuid, key: String },

    /// Another runner won the claim.
    #[serde(rename = "task.claim_conflict")]
    ClaimConflict { run_id: Uuid, task_id: Uuid },

    #[serde(rename = "task.finished")]
    TaskFinished {
        run_id: Uuid,
        task_id: Uuid,
        key: String,
        /// `generated`, `skipped` or `failed`.
        outcome: String,
        detail: Option<String>,
        elapsed_ms: u64,
    },

    // Monitor events
    #[serde(rename = "monitor.stats")]
    StatsPolled { owner_id: String, stats: JobStats },

    #[serde(rename = "monitor.launched")]
    RunLaunched { owner_id: String },

    #[serde(rename = "monitor.progress")]
    ProgressReport {
        owner_id: String,
        stats: JobStats,
        eta_secs: Option<u64>,
    },

    #[serde(rename = "monitor.finished")]
    MonitorFinished { owner_id: String, stats: JobStats },

    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// The run this event belongs to, if it came from a runner.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::RoundStarted { run_id, .. }
            | Event::RoundFinished { run_id, .. }
            | Event::RunFinished { run_id, .. }
            | Event::TaskClaimed { run_id, .. }
            | Event::ClaimConflict { run_id, .. }
            | Event::TaskFinished { run_id, .. } => Some(*run_id),
            Event::StatsPolled { .. }
            | Event::RunLaunched { .. }
            | Event::ProgressReport { .. }
            | Event::MonitorFinished { .. }
            | Event::Error { .. } => None,
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskClaimed { task_id, .. }
            | Event::ClaimConflict { task_id, .. }
            | Event::TaskFinished { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new(Event::RunLaunched {
            owner_id: "owner".to_string(),
        });

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::TaskFinished {
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            key: "p1/t1/en".to_string(),
            outcome: "skipped".to_string(),
            detail: Some("variant has no content".to_string()),
            elapsed_ms: 3,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task.finished"));
        assert!(json.contains("\"outcome\":\"skipped\""));
    }

    #[test]
    fn test_event_deserialization() {
        let json = json!({
            "type": "run.round_started",
            "run_id": "550e8400-e29b-41d4-a716-446655440000",
            "round": 2,
            "batch": 20
        });
        let event: Event = serde_json::from_value(json).unwrap();

        match event {
            Event::RoundStarted { round, batch, .. } => {
                assert_eq!(round, 2);
                assert_eq!(batch, 20);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_run_and_task_ids() {
        let run_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        let event = Event::ClaimConflict { run_id, task_id };
        assert_eq!(event.run_id(), Some(run_id));
        assert_eq!(event.task_id(), Some(task_id));

        let monitor_event = Event::MonitorFinished {
            owner_id: "owner".to_string(),
            stats: JobStats::default(),
        };
        assert_eq!(monitor_event.run_id(), None);
        assert_eq!(monitor_event.task_id(), None);
    }
}
