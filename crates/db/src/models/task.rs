use chrono::{DateTime, TimeZone, Utc};
use genbatch_core::{Task, TaskKey, TaskStatus};
use uuid::Uuid;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub owner_id: String,
    pub subject_id: String,
    pub variant_id: String,
    pub language: String,
    pub status: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub result_meta: Option<String>,
    pub last_run_id: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
}

impl TaskRow {
    pub fn into_domain(self) -> Result<Task, DbError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| DbError::InvalidRecord(format!("task id {}: {}", self.id, e)))?;
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| DbError::InvalidRecord(format!("task {} status {}", id, self.status)))?;
        let result_meta = self
            .result_meta
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        Ok(Task {
            id,
            owner_id: self.owner_id,
            key: TaskKey::new(self.subject_id, self.variant_id, self.language),
            status,
            attempt_count: self.attempt_count.max(0) as u32,
            last_error: self.last_error,
            result_meta,
            last_run_id: self.last_run_id.and_then(|s| Uuid::parse_str(&s).ok()),
            created_at: millis_to_datetime(self.created_at),
            started_at: self.started_at.map(millis_to_datetime),
            finished_at: self.finished_at.map(millis_to_datetime),
            updated_at: millis_to_datetime(self.updated_at),
        })
    }
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            owner_id: task.owner_id.clone(),
            subject_id: task.key.subject_id.clone(),
            variant_id: task.key.variant_id.clone(),
            language: task.key.language.clone(),
            status: task.status.as_str().to_string(),
            attempt_count: i64::from(task.attempt_count),
            last_error: task.last_error.clone(),
            result_meta: task.result_meta.as_ref().map(|v| v.to_string()),
            last_run_id: task.last_run_id.map(|id| id.to_string()),
            created_at: datetime_to_millis(task.created_at),
            started_at: task.started_at.map(datetime_to_millis),
            finished_at: task.finished_at.map(datetime_to_millis),
            updated_at: datetime_to_millis(task.updated_at),
        }
    }
}

pub(crate) fn millis_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts).single().unwrap_or_default()
}

pub(crate) fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}
