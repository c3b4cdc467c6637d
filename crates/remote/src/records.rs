use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use genbatch_core::{
    EligibilityFilter, JobStats, PendingQuery, ResultMeta, Scope, StateStore, StoreError,
    StoreResult, Task, TaskDescriptor, TaskKey, TaskSource, TaskStatus,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RemoteError, Result};
use crate::types::{IdRecord, NewTaskRecord, SubjectRecord, TaskPatch, TaskRecord, VariantRecord};

const TASKS: &str = "generation_tasks";
const SUBJECTS: &str = "subjects";
const VARIANTS: &str = "variants";

/// Rows per insert request when ensuring tasks.
const INSERT_CHUNK: usize = 500;

/// Task source and state store over a PostgREST-style records service.
///
/// Filters use the `column=op.value` query convention. Claims are conditional
/// PATCH requests whose filter includes the expected status, so the service
/// applies them atomically and returns no rows when the race is lost.
#[derive(Clone)]
pub struct RecordsClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl RecordsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn table(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let response = self
            .authorize(self.client.get(self.table(table)).query(query))
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Conditional update; the returned rows are the ones the filter matched.
    async fn patch<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
        patch: &TaskPatch,
    ) -> Result<Vec<T>> {
        let response = self
            .authorize(self.client.patch(self.table(table)).query(query))
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn count(&self, owner_id: &str, status: TaskStatus) -> Result<u64> {
        let response = self
            .authorize(self.client.head(self.table(TASKS)).query(&[
                ("owner_id", eq(owner_id)),
                ("status", eq(status.as_str())),
                ("select", "id".to_string()),
            ]))
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await?;

        let status_code = response.status();
        if !status_code.is_success() {
            return Err(RemoteError::Status {
                status: status_code.as_u16(),
                body: String::new(),
            });
        }

        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::InvalidResponse("missing content-range".to_string()))?;
        parse_total(range)
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let rows: Vec<IdRecord> = self
            .fetch(TASKS, &[("id", eq(id)), ("select", "id".to_string())])
            .await?;
        Ok(!rows.is_empty())
    }

    /// InProgress -> `patch.status`, distinguishing a missing task from one not held.
    async fn finish(&self, id: Uuid, patch: TaskPatch) -> StoreResult<()> {
        let rows: Vec<IdRecord> = self
            .patch(
                TASKS,
                &[
                    ("id", eq(id)),
                    ("status", eq(TaskStatus::InProgress.as_str())),
                    ("select", "id".to_string()),
                ],
                &patch,
            )
            .await?;

        if rows.is_empty() {
            return Err(if self.exists(id).await? {
                StoreError::NotClaimed(id)
            } else {
                StoreError::TaskNotFound(id)
            });
        }
        Ok(())
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}

#[async_trait]
impl TaskSource for RecordsClient {
    async fn list_eligible(
        &self,
        scope: &Scope,
        filter: &EligibilityFilter,
    ) -> StoreResult<Vec<TaskDescriptor>> {
        let mut subject_query = vec![
            ("owner_id", eq(&scope.owner_id)),
            ("select", "id,name,category".to_string()),
            ("order", "created_at.asc,id.asc".to_string()),
        ];
        if filter.require_category {
            subject_query.push(("category", "not.is.null".to_string()));
        }
        if let Some(ids) = filter.subject_ids.as_ref().filter(|ids| !ids.is_empty()) {
            subject_query.push(("id", in_list(ids)));
        }

        let subjects: Vec<SubjectRecord> = self.fetch(SUBJECTS, &subject_query).await?;
        let variants: Vec<VariantRecord> = self
            .fetch(
                VARIANTS,
                &[
                    ("owner_id", eq(&scope.owner_id)),
                    ("select", "id,content".to_string()),
                    ("order", "created_at.asc,id.asc".to_string()),
                ],
            )
            .await?;

        let pairs = subjects
            .iter()
            .filter(|s| {
                !filter.require_category || s.category.as_deref().is_some_and(|c| !c.is_empty())
            })
            .flat_map(|s| variants.iter().map(move |v| s.describe(v)))
            .skip(filter.offset);

        Ok(match filter.limit {
            Some(limit) => pairs.take(limit).collect(),
            None => pairs.collect(),
        })
    }
}

#[async_trait]
impl StateStore for RecordsClient {
    async fn health_check(&self) -> StoreResult<()> {
        let _: Vec<IdRecord> = self
            .fetch(TASKS, &[("select", "id".to_string()), ("limit", "1".to_string())])
            .await?;
        Ok(())
    }

    async fn get_stats(&self, scope: &Scope) -> StoreResult<JobStats> {
        let mut counts = Vec::with_capacity(TaskStatus::ALL.len());
        for status in TaskStatus::ALL {
            counts.push((status, self.count(&scope.owner_id, status).await?));
        }
        Ok(JobStats::from_counts(counts))
    }

    async fn ensure_tasks(&self, scope: &Scope, keys: &[TaskKey]) -> StoreResult<usize> {
        let mut created = 0;
        for chunk in keys.chunks(INSERT_CHUNK) {
            let rows: Vec<NewTaskRecord<'_>> = chunk
                .iter()
                .map(|key| NewTaskRecord::new(&scope.owner_id, key))
                .collect();

            let response = self
                .authorize(self.client.post(self.table(TASKS)).query(&[
                    ("on_conflict", "subject_id,variant_id,language".to_string()),
                    ("select", "id".to_string()),
                ]))
                .header("Prefer", "resolution=ignore-duplicates,return=representation")
                .json(&rows)
                .send()
                .await
                .map_err(RemoteError::from)?;

            let inserted: Vec<IdRecord> = self.handle_response(response).await?;
            created += inserted.len();
        }

        debug!(owner = %scope.owner_id, requested = keys.len(), created, "Ensured task records");
        Ok(created)
    }

    async fn list_pending(&self, query: &PendingQuery) -> StoreResult<Vec<Task>> {
        let mut params = vec![
            ("owner_id", eq(&query.scope.owner_id)),
            ("order", "created_at.asc,id.asc".to_string()),
            ("limit", query.limit.to_string()),
        ];

        match (query.include_failed, query.exclude_run) {
            (false, _) => params.push(("status", eq(TaskStatus::Pending.as_str()))),
            (true, None) => params.push(("status", "in.(pending,failed)".to_string())),
            (true, Some(run_id)) => params.push((
                "or",
                format!(
                    "(status.eq.pending,and(status.eq.failed,or(last_run_id.is.null,last_run_id.neq.{})))",
                    run_id
                ),
            )),
        }
        if !query.languages.is_empty() {
            params.push(("language", in_list(&query.languages)));
        }

        let rows: Vec<TaskRecord> = self.fetch(TASKS, &params).await?;
        rows.into_iter()
            .map(|row| row.into_domain().map_err(StoreError::from))
            .collect()
    }

    async fn mark_in_progress(&self, id: Uuid, run_id: Uuid) -> StoreResult<bool> {
        let now = Utc::now();
        let patch = TaskPatch::status(TaskStatus::InProgress)
            .with_run(run_id)
            .with_started_at(Some(now))
            .with_finished_at(None);

        let claimed: Vec<TaskRecord> = self
            .patch(
                TASKS,
                &[("id", eq(id)), ("status", "in.(pending,failed)".to_string())],
                &patch,
            )
            .await?;

        let Some(row) = claimed.into_iter().next() else {
            if !self.exists(id).await? {
                return Err(StoreError::TaskNotFound(id));
            }
            return Ok(false);
        };

        // The claim is ours now, so bumping the counter cannot race another runner.
        let bump = TaskPatch {
            attempt_count: Some(row.attempt_count + 1),
            updated_at: now,
            ..Default::default()
        };
        let bumped: Result<Vec<IdRecord>> = self
            .patch(
                TASKS,
                &[
                    ("id", eq(id)),
                    ("last_run_id", eq(run_id)),
                    ("select", "id".to_string()),
                ],
                &bump,
            )
            .await;
        // The row is already in_progress under this run; reporting the claim
        // as failed would strand it.
        match bumped {
            Ok(rows) if rows.is_empty() => {
                warn!(task_id = %id, "Attempt counter update matched no rows")
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %id, error = %e, "Attempt counter update failed"),
        }

        Ok(true)
    }

    async fn mark_completed(&self, id: Uuid, meta: &ResultMeta) -> StoreResult<()> {
        let meta = serde_json::to_value(meta).map_err(RemoteError::from)?;
        let patch = TaskPatch::status(TaskStatus::Completed)
            .with_error(None)
            .with_result_meta(meta)
            .with_finished_at(Some(Utc::now()));
        self.finish(id, patch).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> StoreResult<()> {
        let patch = TaskPatch::status(TaskStatus::Failed)
            .with_error(Some(error.to_string()))
            .with_finished_at(Some(Utc::now()));
        self.finish(id, patch).await
    }

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> StoreResult<()> {
        let patch = TaskPatch::status(TaskStatus::Skipped)
            .with_error(Some(reason.to_string()))
            .with_finished_at(Some(Utc::now()));
        self.finish(id, patch).await
    }

    async fn reopen_completed(&self, scope: &Scope, languages: &[String]) -> StoreResult<usize> {
        let mut params = vec![
            ("owner_id", eq(&scope.owner_id)),
            ("status", eq(TaskStatus::Completed.as_str())),
            ("select", "id".to_string()),
        ];
        if !languages.is_empty() {
            params.push(("language", in_list(languages)));
        }

        let patch = TaskPatch::status(TaskStatus::Pending).with_finished_at(None);
        let reopened: Vec<IdRecord> = self.patch(TASKS, &params, &patch).await?;
        Ok(reopened.len())
    }

    async fn release_stale(&self, scope: &Scope, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let params = [
            ("owner_id", eq(&scope.owner_id)),
            ("status", eq(TaskStatus::InProgress.as_str())),
            (
                "started_at",
                format!("lt.{}", older_than.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            ("select", "id".to_string()),
        ];

        let patch = TaskPatch::status(TaskStatus::Pending).with_started_at(None);
        let released: Vec<IdRecord> = self.patch(TASKS, &params, &patch).await?;
        Ok(released.len())
    }
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{}", value)
}

fn in_list(values: &[String]) -> String {
    format!("in.({})", values.join(","))
}

/// Total from a `Content-Range` header such as `0-0/42` or `*/0`.
fn parse_total(range: &str) -> Result<u64> {
    range
        .rsplit_once('/')
        .and_then(|(_, total)| total.parse().ok())
        .ok_or_else(|| RemoteError::InvalidResponse(format!("unusable content-range '{}'", range)))
}
