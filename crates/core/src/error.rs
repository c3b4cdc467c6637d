use thiserror::Error;
use uuid::Uuid;

/// Failures of a task source or state store call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or timed out.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A terminal transition was attempted on a task this caller does not hold.
    #[error("Task {0} is not in progress")]
    NotClaimed(Uuid),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failures of the remote work step for a single task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
    /// Upstream content the task depends on is absent.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed result: {0}")]
    Malformed(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),
}

impl WorkError {
    /// Skips are recorded as Skipped, never as failures.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::MissingPrerequisite(_))
    }
}
