use crate::error::DbError;
use crate::models::{datetime_to_millis, TaskRow};
use chrono::{DateTime, Utc};
use genbatch_core::{JobStats, PendingQuery, Scope, Task, TaskKey, TaskStatus};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, owner_id, subject_id, variant_id, language, status, attempt_count, \
     last_error, result_meta, last_run_id, created_at, started_at, finished_at, updated_at";

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, subject_id, variant_id, language, status, attempt_count,
                last_error, result_meta, last_run_id, created_at, started_at, finished_at, updated_at
            FROM generation_tasks
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_domain).transpose()
    }

    pub async fn find_by_key(&self, key: &TaskKey) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, subject_id, variant_id, language, status, attempt_count,
                last_error, result_meta, last_run_id, created_at, started_at, finished_at, updated_at
            FROM generation_tasks
            WHERE subject_id = ? AND variant_id = ? AND language = ?
            "#,
        )
        .bind(&key.subject_id)
        .bind(&key.variant_id)
        .bind(&key.language)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_domain).transpose()
    }

    pub async fn find_by_status(
        &self,
        owner_id: &str,
        status: TaskStatus,
        limit: usize,
    ) -> Result<Vec<Task>, DbError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, owner_id, subject_id, variant_id, language, status, attempt_count,
                last_error, result_meta, last_run_id, created_at, started_at, finished_at, updated_at
            FROM generation_tasks
            WHERE owner_id = ? AND status = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// Inserts a pending record for every key that has none. Returns how many were created.
    pub async fn ensure(&self, scope: &Scope, keys: &[TaskKey]) -> Result<usize, DbError> {
        let now = Utc::now().timestamp_millis();
        let mut created = 0usize;
        let mut tx = self.pool.begin().await?;

        for key in keys {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO generation_tasks
                    (id, owner_id, subject_id, variant_id, language, status, attempt_count, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&scope.owner_id)
            .bind(&key.subject_id)
            .bind(&key.variant_id)
            .bind(&key.language)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected() as usize;
        }

        tx.commit().await?;
        debug!(owner = %scope.owner_id, requested = keys.len(), created, "Ensured task records");
        Ok(created)
    }

    pub async fn list_pending(&self, query: &PendingQuery) -> Result<Vec<Task>, DbError> {
        let exclude_run = query.exclude_run.map(|id| id.to_string()).unwrap_or_default();

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS} FROM generation_tasks WHERE owner_id = "
        ));
        builder.push_bind(query.scope.owner_id.clone());
        builder.push(" AND (status = 'pending' OR (");
        builder.push_bind(query.include_failed);
        builder.push(" AND status = 'failed' AND (last_run_id IS NULL OR last_run_id != ");
        builder.push_bind(exclude_run);
        builder.push(")))");
        push_language_filter(&mut builder, &query.languages);
        builder.push(" ORDER BY created_at ASC, rowid ASC LIMIT ");
        builder.push_bind(query.limit as i64);

        let rows: Vec<TaskRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// Single conditional update; `false` when the task is not claimable any more.
    pub async fn claim(&self, id: Uuid, run_id: Uuid) -> Result<bool, DbError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = 'in_progress', attempt_count = attempt_count + 1, last_run_id = ?,
                started_at = ?, finished_at = NULL, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'failed')
            "#,
        )
        .bind(run_id.to_string())
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(DbError::TaskNotFound(id));
        }
        Ok(false)
    }

    /// Moves an in-progress task to a terminal status for this round.
    pub async fn finish(
        &self,
        id: Uuid,
        to: TaskStatus,
        last_error: Option<&str>,
        result_meta: Option<String>,
    ) -> Result<(), DbError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = ?, last_error = ?, result_meta = COALESCE(?, result_meta),
                finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(to.as_str())
        .bind(last_error)
        .bind(result_meta)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.exists(id).await? {
                DbError::NotClaimed(id)
            } else {
                DbError::TaskNotFound(id)
            });
        }
        Ok(())
    }

    pub async fn reopen_completed(
        &self,
        scope: &Scope,
        languages: &[String],
    ) -> Result<usize, DbError> {
        let now = Utc::now().timestamp_millis();
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE generation_tasks SET status = 'pending', finished_at = NULL, updated_at = ",
        );
        builder.push_bind(now);
        builder.push(" WHERE status = 'completed' AND owner_id = ");
        builder.push_bind(scope.owner_id.clone());
        push_language_filter(&mut builder, languages);

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn release_stale(
        &self,
        scope: &Scope,
        older_than: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE generation_tasks
            SET status = 'pending', started_at = NULL, updated_at = ?
            WHERE owner_id = ? AND status = 'in_progress'
                AND (started_at IS NULL OR started_at < ?)
            "#,
        )
        .bind(now)
        .bind(&scope.owner_id)
        .bind(datetime_to_millis(older_than))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    pub async fn stats(&self, owner_id: &str) -> Result<JobStats, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM generation_tasks
            WHERE owner_id = ?
            GROUP BY status
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let counts = rows
            .into_iter()
            .map(|(status, count)| {
                TaskStatus::parse(&status)
                    .map(|s| (s, count.max(0) as u64))
                    .ok_or_else(|| DbError::InvalidRecord(format!("unknown status {}", status)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobStats::from_counts(counts))
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn exists(&self, id: Uuid) -> Result<bool, DbError> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM generation_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

fn push_language_filter(builder: &mut QueryBuilder<'_, Sqlite>, languages: &[String]) {
    if languages.is_empty() {
        return;
    }
    builder.push(" AND language IN (");
    let mut separated = builder.separated(", ");
    for language in languages {
        separated.push_bind(language.clone());
    }
    separated.push_unseparated(")");
}
