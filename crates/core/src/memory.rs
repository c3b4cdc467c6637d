//! In-process store used by tests and dry runs.
//!
//! Every operation takes the lock once, so a claim is a single
//! compare-and-set just like the conditional update of the real backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{JobStats, ResultMeta, Scope, Task, TaskDescriptor, TaskKey, TaskStatus};
use crate::error::StoreError;
use crate::traits::{EligibilityFilter, PendingQuery, StateStore, StoreResult, TaskSource};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    /// Creation order, the stable tiebreak for `list_pending`.
    order: Vec<Uuid>,
    keys: HashMap<(String, TaskKey), Uuid>,
    catalog: Vec<(String, TaskDescriptor)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an eligible pair for `scope` in the task source catalog.
    pub fn add_descriptor(&self, scope: &Scope, descriptor: TaskDescriptor) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.catalog.push((scope.owner_id.clone(), descriptor));
        }
    }

    /// Inserts a task as-is, replacing any record with the same key.
    pub fn insert_task(&self, task: Task) {
        if let Ok(mut inner) = self.inner.lock() {
            let index_key = (task.owner_id.clone(), task.key.clone());
            if let Some(previous) = inner.keys.insert(index_key, task.id) {
                inner.tasks.remove(&previous);
                inner.order.retain(|id| *id != previous);
            }
            inner.order.push(task.id);
            inner.tasks.insert(task.id, task);
        }
    }

    /// Simulates an unreachable backend: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of all tasks in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        match self.inner.lock() {
            Ok(inner) => inner
                .order
                .iter()
                .filter_map(|id| inner.tasks.get(id).cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, scope: &Scope, key: &TaskKey) -> Option<Task> {
        let inner = self.inner.lock().ok()?;
        let id = inner.keys.get(&(scope.owner_id.clone(), key.clone()))?;
        inner.tasks.get(id).cloned()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn finish(&self, id: Uuid, to: TaskStatus, apply: impl FnOnce(&mut Task)) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if task.status != TaskStatus::InProgress {
            return Err(StoreError::NotClaimed(id));
        }

        let now = Utc::now();
        task.status = to;
        task.finished_at = Some(now);
        task.updated_at = now;
        apply(task);
        Ok(())
    }
}

#[async_trait]
impl TaskSource for MemoryStore {
    async fn list_eligible(
        &self,
        scope: &Scope,
        filter: &EligibilityFilter,
    ) -> StoreResult<Vec<TaskDescriptor>> {
        let inner = self.lock()?;
        let matching = inner
            .catalog
            .iter()
            .filter(|(owner, _)| *owner == scope.owner_id)
            .map(|(_, descriptor)| descriptor)
            .filter(|d| !filter.require_category || d.category.is_some())
            .filter(|d| {
                filter
                    .subject_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&d.subject_id))
            })
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }

    async fn get_stats(&self, scope: &Scope) -> StoreResult<JobStats> {
        let inner = self.lock()?;
        Ok(JobStats::from_tasks(
            inner.tasks.values().filter(|t| t.owner_id == scope.owner_id),
        ))
    }

    async fn ensure_tasks(&self, scope: &Scope, keys: &[TaskKey]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let mut created = 0;
        for key in keys {
            let index_key = (scope.owner_id.clone(), key.clone());
            if inner.keys.contains_key(&index_key) {
                continue;
            }
            let task = Task::new(scope, key.clone());
            inner.keys.insert(index_key, task.id);
            inner.order.push(task.id);
            inner.tasks.insert(task.id, task);
            created += 1;
        }
        Ok(created)
    }

    async fn list_pending(&self, query: &PendingQuery) -> StoreResult<Vec<Task>> {
        let inner = self.lock()?;
        let mut pending: Vec<(usize, &Task)> = inner
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| inner.tasks.get(id).map(|t| (seq, t)))
            .filter(|(_, task)| query.matches(task))
            .collect();
        pending.sort_by(|(a_seq, a), (b_seq, b)| {
            a.created_at.cmp(&b.created_at).then(a_seq.cmp(b_seq))
        });
        Ok(pending
            .into_iter()
            .take(query.limit)
            .map(|(_, task)| task.clone())
            .collect())
    }

    async fn mark_in_progress(&self, id: Uuid, run_id: Uuid) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if !task.status.is_claimable() {
            return Ok(false);
        }

        let now = Utc::now();
        task.status = TaskStatus::InProgress;
        task.attempt_count += 1;
        task.last_run_id = Some(run_id);
        task.started_at = Some(now);
        task.finished_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_completed(&self, id: Uuid, meta: &ResultMeta) -> StoreResult<()> {
        let meta = serde_json::to_value(meta)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        self.finish(id, TaskStatus::Completed, |task| {
            task.last_error = None;
            task.result_meta = Some(meta);
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> StoreResult<()> {
        self.finish(id, TaskStatus::Failed, |task| {
            task.last_error = Some(error.to_string());
        })
    }

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> StoreResult<()> {
        self.finish(id, TaskStatus::Skipped, |task| {
            task.last_error = Some(reason.to_string());
        })
    }

    async fn reopen_completed(&self, scope: &Scope, languages: &[String]) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut reopened = 0;
        for task in inner.tasks.values_mut() {
            let language_ok = languages.is_empty() || languages.contains(&task.key.language);
            if task.owner_id == scope.owner_id
                && task.status == TaskStatus::Completed
                && language_ok
            {
                task.status = TaskStatus::Pending;
                task.finished_at = None;
                task.updated_at = now;
                reopened += 1;
            }
        }
        Ok(reopened)
    }

    async fn release_stale(&self, scope: &Scope, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut released = 0;
        for task in inner.tasks.values_mut() {
            let stale = task.started_at.map_or(true, |started| started < older_than);
            if task.owner_id == scope.owner_id && task.status == TaskStatus::InProgress && stale {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope::new("owner")
    }

    fn keys(n: usize) -> Vec<TaskKey> {
        (0..n)
            .map(|i| TaskKey::new(format!("subject-{i}"), "variant", "en"))
            .collect()
    }

    #[tokio::test]
    async fn test_ensure_tasks_is_idempotent() {
        let store = MemoryStore::new();

        assert_eq!(store.ensure_tasks(&scope(), &keys(3)).await.unwrap(), 3);
        assert_eq!(store.ensure_tasks(&scope(), &keys(3)).await.unwrap(), 0);
        assert_eq!(store.tasks().len(), 3);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        store.ensure_tasks(&scope(), &keys(1)).await.unwrap();
        let id = store.tasks()[0].id;

        let claims = futures::future::join_all(
            (0..16).map(|_| store.mark_in_progress(id, Uuid::new_v4())),
        )
        .await;

        let won = claims.into_iter().filter(|c| matches!(c, Ok(true))).count();
        assert_eq!(won, 1);
        assert_eq!(store.tasks()[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_terminal_transition_requires_claim() {
        let store = MemoryStore::new();
        store.ensure_tasks(&scope(), &keys(1)).await.unwrap();
        let id = store.tasks()[0].id;

        let err = store.mark_failed(id, "nope").await.unwrap_err();
        assert_eq!(err, StoreError::NotClaimed(id));

        store.mark_in_progress(id, Uuid::new_v4()).await.unwrap();
        store.mark_failed(id, "remote 500").await.unwrap();

        let task = &store.tasks()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("remote 500"));
    }

    #[tokio::test]
    async fn test_list_pending_orders_by_creation() {
        let store = MemoryStore::new();
        store.ensure_tasks(&scope(), &keys(5)).await.unwrap();

        let pending = store
            .list_pending(&PendingQuery::new(scope(), 3))
            .await
            .unwrap();

        let subjects: Vec<_> = pending.iter().map(|t| t.key.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["subject-0", "subject-1", "subject-2"]);
    }

    #[tokio::test]
    async fn test_offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);

        let err = store.get_stats(&scope()).await.unwrap_err();
        assert!(err.is_transient());

        store.set_offline(false);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_release_stale_and_reopen() {
        let store = MemoryStore::new();
        store.ensure_tasks(&scope(), &keys(2)).await.unwrap();
        let ids: Vec<_> = store.tasks().iter().map(|t| t.id).collect();

        store.mark_in_progress(ids[0], Uuid::new_v4()).await.unwrap();
        store.mark_in_progress(ids[1], Uuid::new_v4()).await.unwrap();
        store.mark_completed(ids[1], &ResultMeta::default()).await.unwrap();

        let released = store
            .release_stale(&scope(), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let reopened = store.reopen_completed(&scope(), &[]).await.unwrap();
        assert_eq!(reopened, 1);

        let stats = store.get_stats(&scope()).await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn test_list_eligible_filters() {
        let store = MemoryStore::new();
        store.add_descriptor(&scope(), TaskDescriptor::new("p1", "t1").with_category("a"));
        store.add_descriptor(&scope(), TaskDescriptor::new("p2", "t1"));
        store.add_descriptor(&Scope::new("other"), TaskDescriptor::new("p3", "t1"));

        let all = store
            .list_eligible(&scope(), &EligibilityFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let categorized = store
            .list_eligible(&scope(), &EligibilityFilter::default().with_category_required(true))
            .await
            .unwrap();
        assert_eq!(categorized.len(), 1);
        assert_eq!(categorized[0].subject_id, "p1");

        let paged = store
            .list_eligible(&scope(), &EligibilityFilter::default().page(1, 1))
            .await
            .unwrap();
        assert_eq!(paged[0].subject_id, "p2");
    }
}
