use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genbatch_core::{
    EligibilityFilter, JobStats, PendingQuery, ResultMeta, Scope, StateStore, StoreError,
    StoreResult, Task, TaskDescriptor, TaskKey, TaskSource, TaskStatus,
};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::repositories::{CatalogRepository, TaskRepository};

/// SQLite-backed task source and state store.
#[derive(Clone)]
pub struct SqliteStore {
    tasks: TaskRepository,
    catalog: CatalogRepository,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: TaskRepository::new(pool.clone()),
            catalog: CatalogRepository::new(pool),
        }
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn catalog(&self) -> &CatalogRepository {
        &self.catalog
    }
}

#[async_trait]
impl TaskSource for SqliteStore {
    async fn list_eligible(
        &self,
        scope: &Scope,
        filter: &EligibilityFilter,
    ) -> StoreResult<Vec<TaskDescriptor>> {
        Ok(self.catalog.list_descriptors(&scope.owner_id, filter).await?)
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(self.tasks.ping().await?)
    }

    async fn get_stats(&self, scope: &Scope) -> StoreResult<JobStats> {
        Ok(self.tasks.stats(&scope.owner_id).await?)
    }

    async fn ensure_tasks(&self, scope: &Scope, keys: &[TaskKey]) -> StoreResult<usize> {
        Ok(self.tasks.ensure(scope, keys).await?)
    }

    async fn list_pending(&self, query: &PendingQuery) -> StoreResult<Vec<Task>> {
        Ok(self.tasks.list_pending(query).await?)
    }

    async fn mark_in_progress(&self, id: Uuid, run_id: Uuid) -> StoreResult<bool> {
        Ok(self.tasks.claim(id, run_id).await?)
    }

    async fn mark_completed(&self, id: Uuid, meta: &ResultMeta) -> StoreResult<()> {
        let meta = serde_json::to_string(meta)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        Ok(self
            .tasks
            .finish(id, TaskStatus::Completed, None, Some(meta))
            .await?)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> StoreResult<()> {
        Ok(self
            .tasks
            .finish(id, TaskStatus::Failed, Some(error), None)
            .await?)
    }

    async fn mark_skipped(&self, id: Uuid, reason: &str) -> StoreResult<()> {
        Ok(self
            .tasks
            .finish(id, TaskStatus::Skipped, Some(reason), None)
            .await?)
    }

    async fn reopen_completed(&self, scope: &Scope, languages: &[String]) -> StoreResult<usize> {
        Ok(self.tasks.reopen_completed(scope, languages).await?)
    }

    async fn release_stale(&self, scope: &Scope, older_than: DateTime<Utc>) -> StoreResult<usize> {
        Ok(self.tasks.release_stale(scope, older_than).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use genbatch_core::{Catalog, Subject, Variant};
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("store.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (SqliteStore::new(pool), dir)
    }

    #[tokio::test]
    async fn test_store_lifecycle_through_traits() {
        let (store, _dir) = setup_store().await;
        let scope = Scope::new("owner");
        store
            .catalog()
            .import(
                "owner",
                &Catalog {
                    subjects: vec![Subject {
                        id: "p1".into(),
                        name: "Acme".into(),
                        category: Some("retail".into()),
                    }],
                    variants: vec![Variant {
                        id: "t1".into(),
                        name: "Home".into(),
                        content: Some("body".into()),
                    }],
                },
            )
            .await
            .unwrap();

        let descriptors = store
            .list_eligible(&scope, &EligibilityFilter::default())
            .await
            .unwrap();
        let keys: Vec<_> = descriptors.iter().map(|d| d.key_for("en")).collect();
        assert_eq!(store.ensure_tasks(&scope, &keys).await.unwrap(), 1);

        let pending = store
            .list_pending(&PendingQuery::new(scope.clone(), 10))
            .await
            .unwrap();
        let id = pending[0].id;
        assert!(store.mark_in_progress(id, Uuid::new_v4()).await.unwrap());

        let meta = ResultMeta {
            content_chars: 42,
            model: Some("m".into()),
            elapsed_ms: 7,
        };
        store.mark_completed(id, &meta).await.unwrap();

        let stats = store.get_stats(&scope).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total, 1);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_not_claimed_maps_to_store_error() {
        let (store, _dir) = setup_store().await;
        let scope = Scope::new("owner");
        store
            .ensure_tasks(&scope, &[TaskKey::new("p", "t", "en")])
            .await
            .unwrap();
        let id = store
            .tasks()
            .find_by_key(&TaskKey::new("p", "t", "en"))
            .await
            .unwrap()
            .unwrap()
            .id;

        let err = store.mark_skipped(id, "no content").await.unwrap_err();
        assert_eq!(err, StoreError::NotClaimed(id));
    }
}
