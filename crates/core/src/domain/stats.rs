use serde::{Deserialize, Serialize};

use super::task::{Task, TaskStatus};

/// Aggregate counts over every task in a scope.
///
/// Always derived from store content at query time, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl JobStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        Self::from_counts(tasks.into_iter().map(|task| (task.status, 1)))
    }

    /// Builds stats from per-status counts, e.g. the rows of a `GROUP BY status` query.
    pub fn from_counts(counts: impl IntoIterator<Item = (TaskStatus, u64)>) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            match status {
                TaskStatus::Pending => stats.pending += count,
                TaskStatus::InProgress => stats.in_progress += count,
                TaskStatus::Completed => stats.completed += count,
                TaskStatus::Failed => stats.failed += count,
                TaskStatus::Skipped => stats.skipped += count,
            }
            stats.total += count;
        }
        stats
    }

    /// Tasks that still need work (failed ones are resumable).
    pub fn remaining(&self) -> u64 {
        self.pending + self.in_progress + self.failed
    }

    pub fn is_idle(&self) -> bool {
        self.in_progress == 0
    }

    pub fn percent_completed(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }
}
