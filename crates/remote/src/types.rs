use chrono::{DateTime, Utc};
use genbatch_core::{Task, TaskDescriptor, TaskKey, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;

/// A `generation_tasks` row as the records service returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub subject_id: String,
    pub variant_id: String,
    pub language: String,
    pub status: String,
    #[serde(default)]
    pub attempt_count: i64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result_meta: Option<serde_json::Value>,
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn into_domain(self) -> Result<Task, RemoteError> {
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            RemoteError::InvalidResponse(format!("unknown task status '{}'", self.status))
        })?;

        Ok(Task {
            id: self.id,
            owner_id: self.owner_id,
            key: TaskKey::new(self.subject_id, self.variant_id, self.language),
            status,
            attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
            last_error: self.last_error,
            result_meta: self.result_meta,
            last_run_id: self.last_run_id,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        })
    }
}

/// Insert payload; the service fills id and timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct NewTaskRecord<'a> {
    pub owner_id: &'a str,
    pub subject_id: &'a str,
    pub variant_id: &'a str,
    pub language: &'a str,
    pub status: &'static str,
}

impl<'a> NewTaskRecord<'a> {
    pub fn new(owner_id: &'a str, key: &'a TaskKey) -> Self {
        Self {
            owner_id,
            subject_id: &key.subject_id,
            variant_id: &key.variant_id,
            language: &key.language,
            status: TaskStatus::Pending.as_str(),
        }
    }
}

/// Partial update sent with PATCH. Absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status.as_str()),
            updated_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn with_result_meta(mut self, meta: serde_json::Value) -> Self {
        self.result_meta = Some(meta);
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.last_run_id = Some(run_id);
        self
    }

    pub fn with_started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantRecord {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl SubjectRecord {
    pub fn describe(&self, variant: &VariantRecord) -> TaskDescriptor {
        TaskDescriptor {
            subject_id: self.id.clone(),
            variant_id: variant.id.clone(),
            subject_name: self.name.clone(),
            category: self.category.clone(),
            has_content: variant
                .content
                .as_deref()
                .is_some_and(|c| !c.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdRecord {
    pub id: Uuid,
}

/// Body for the generation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateRequest {
    pub subject_id: String,
    pub variant_id: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl GenerateRequest {
    pub fn new(key: &TaskKey) -> Self {
        Self {
            subject_id: key.subject_id.clone(),
            variant_id: key.variant_id.clone(),
            language: key.language.clone(),
            category: None,
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_record_into_domain() {
        let record: TaskRecord = serde_json::from_value(json!({
            "id": "6f1c1b0e-8a57-4f0a-9a8e-2b1f4c7d9e01",
            "owner_id": "owner",
            "subject_id": "p1",
            "variant_id": "t1",
            "language": "de",
            "status": "failed",
            "attempt_count": 2,
            "last_error": "boom",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:05:00Z"
        }))
        .unwrap();

        let task = record.into_domain().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.key, TaskKey::new("p1", "t1", "de"));
        assert_eq!(task.attempt_count, 2);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let record: TaskRecord = serde_json::from_value(json!({
            "id": "6f1c1b0e-8a57-4f0a-9a8e-2b1f4c7d9e01",
            "owner_id": "owner",
            "subject_id": "p1",
            "variant_id": "t1",
            "language": "en",
            "status": "archived",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap();

        assert!(matches!(
            record.into_domain(),
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_patch_serializes_explicit_nulls_only_when_set() {
        let patch = TaskPatch::status(TaskStatus::Pending).with_started_at(None);
        let value = serde_json::to_value(&patch).unwrap();

        assert_eq!(value["status"], "pending");
        assert!(value["started_at"].is_null());
        assert!(value.get("started_at").is_some());
        assert!(value.get("finished_at").is_none());
        assert!(value.get("last_error").is_none());
    }

    #[test]
    fn test_generate_request_omits_missing_category() {
        let request = GenerateRequest::new(&TaskKey::new("p", "t", "fr"));
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("category").is_none());

        let request = request.with_category(Some("retail".into()));
        assert_eq!(request.category.as_deref(), Some("retail"));
    }
}
