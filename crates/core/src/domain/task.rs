use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Prerequisites were missing; never retried automatically.
    Skipped,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Statuses a claim may start from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner scope that every enumeration, query and stats call is restricted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub owner_id: String,
}

impl Scope {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.owner_id)
    }
}

/// Immutable identity of a generation task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub subject_id: String,
    pub variant_id: String,
    pub language: String,
}

impl TaskKey {
    pub fn new(
        subject_id: impl Into<String>,
        variant_id: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            variant_id: variant_id.into(),
            language: language.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject_id, self.variant_id, self.language)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: String,
    #[serde(flatten)]
    pub key: TaskKey,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub result_meta: Option<serde_json::Value>,
    /// Run that last claimed this task.
    pub last_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(scope: &Scope, key: TaskKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: scope.owner_id.clone(),
            key,
            status: TaskStatus::default(),
            attempt_count: 0,
            last_error: None,
            result_meta: None,
            last_run_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// An eligible (subject, variant) pair as reported by a task source.
///
/// The orchestrator crosses each descriptor with the requested languages
/// to obtain task keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub subject_id: String,
    pub variant_id: String,
    pub subject_name: Option<String>,
    pub category: Option<String>,
    /// Whether the variant has upstream content to generate from.
    pub has_content: bool,
}

impl TaskDescriptor {
    pub fn new(subject_id: impl Into<String>, variant_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            variant_id: variant_id.into(),
            subject_name: None,
            category: None,
            has_content: true,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn without_content(mut self) -> Self {
        self.has_content = false;
        self
    }

    pub fn key_for(&self, language: &str) -> TaskKey {
        TaskKey::new(&self.subject_id, &self.variant_id, language)
    }

    pub fn describes(&self, key: &TaskKey) -> bool {
        self.subject_id == key.subject_id && self.variant_id == key.variant_id
    }
}
