use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{JobStats, ResultMeta, Scope, Task, TaskDescriptor, TaskKey};
use crate::error::{StoreError, WorkError};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Narrows task source enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EligibilityFilter {
    /// Only subjects with a non-null category.
    pub require_category: bool,
    /// Restrict to these subjects when set.
    pub subject_ids: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EligibilityFilter {
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn with_category_required(mut self, required: bool) -> Self {
        self.require_category = required;
        self
    }
}

/// Selection of claimable tasks for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub scope: Scope,
    pub limit: usize,
    /// Empty means every language.
    pub languages: Vec<String>,
    /// Also return Failed tasks (resume from failure).
    pub include_failed: bool,
    /// Failed tasks last claimed by this run are not returned.
    pub exclude_run: Option<Uuid>,
}

impl PendingQuery {
    pub fn new(scope: Scope, limit: usize) -> Self {
        Self {
            scope,
            limit,
            languages: Vec::new(),
            include_failed: false,
            exclude_run: None,
        }
    }

    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    pub fn with_failed(mut self, include: bool) -> Self {
        self.include_failed = include;
        self
    }

    pub fn excluding_run(mut self, run_id: Uuid) -> Self {
        self.exclude_run = Some(run_id);
        self
    }

    pub fn accepts_language(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }

    /// Whether `task` belongs in the result set, ignoring order and limit.
    pub fn matches(&self, task: &Task) -> bool {
        use crate::domain::TaskStatus;

        if task.owner_id != self.scope.owner_id || !self.accepts_language(&task.key.language) {
            return false;
        }
        match task.status {
            TaskStatus::Pending => true,
            TaskStatus::Failed => {
                self.include_failed
                    && (self.exclude_run.is_none() || task.last_run_id != self.exclude_run)
            }
            _ => false,
        }
    }
}

/// Enumerates eligible (subject, variant) pairs.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Idempotent while no writes occur. An unreachable store is an error,
    /// never an empty list.
    async fn list_eligible(
        &self,
        scope: &Scope,
        filter: &EligibilityFilter,
    ) -> StoreResult<Vec<TaskDescriptor>>;
}

/// Durable per-task state. The single source of truth for what happened.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;

    async fn get_stats(&self, scope: &Scope) -> StoreResult<JobStats>;

    /// Inserts missing records; existing ones are untouched. Returns the number created.
    async fn ensure_tasks(&self, scope: &Scope, keys: &[TaskKey]) -> StoreResult<usize>;

    /// Ordered by creation time ascending with a stable tiebreak.
    async fn list_pending(&self, query: &PendingQuery) -> StoreResult<Vec<Task>>;

    /// Atomic Pending/Failed -> InProgress. `false` when another caller holds the task.
    async fn mark_in_progress(&self, id: Uuid, run_id: Uuid) -> StoreResult<bool>;

    async fn mark_completed(&self, id: Uuid, meta: &ResultMeta) -> StoreResult<()>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> StoreResult<()>;

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> StoreResult<()>;

    /// Completed -> Pending for the given languages (empty = all). Returns the count.
    async fn reopen_completed(&self, scope: &Scope, languages: &[String]) -> StoreResult<usize>;

    /// InProgress tasks started before `older_than` go back to Pending.
    async fn release_stale(&self, scope: &Scope, older_than: DateTime<Utc>) -> StoreResult<usize>;
}

/// A claimed task handed to the work step.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task: Task,
    /// Known when this run enumerated the task's pair.
    pub descriptor: Option<TaskDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub content: String,
    pub model: Option<String>,
}

impl StepOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
        }
    }
}

/// Performs one task against the downstream generation service.
#[async_trait]
pub trait WorkStep: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> std::result::Result<StepOutput, WorkError>;
}
