use crate::error::DbError;
use crate::models::DescriptorRow;
use chrono::Utc;
use genbatch_core::{Catalog, EligibilityFilter, Subject, TaskDescriptor, Variant};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::info;

#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upserts every subject and variant of `catalog` under `owner_id` in one transaction.
    pub async fn import(
        &self,
        owner_id: &str,
        catalog: &Catalog,
    ) -> Result<(usize, usize), DbError> {
        let mut tx = self.pool.begin().await?;

        for subject in &catalog.subjects {
            upsert_subject(&mut tx, owner_id, subject).await?;
        }
        for variant in &catalog.variants {
            upsert_variant(&mut tx, owner_id, variant).await?;
        }

        tx.commit().await?;
        info!(
            owner = %owner_id,
            subjects = catalog.subjects.len(),
            variants = catalog.variants.len(),
            "Catalog imported"
        );
        Ok((catalog.subjects.len(), catalog.variants.len()))
    }

    pub async fn upsert_subject(&self, owner_id: &str, subject: &Subject) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        upsert_subject(&mut conn, owner_id, subject).await
    }

    pub async fn upsert_variant(&self, owner_id: &str, variant: &Variant) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        upsert_variant(&mut conn, owner_id, variant).await
    }

    /// Subject x variant pairs for the owner, in a stable order so paging is repeatable.
    pub async fn list_descriptors(
        &self,
        owner_id: &str,
        filter: &EligibilityFilter,
    ) -> Result<Vec<TaskDescriptor>, DbError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT s.id AS subject_id, v.id AS variant_id, s.name AS subject_name,
                s.category AS category,
                (v.content IS NOT NULL AND length(trim(v.content)) > 0) AS has_content
            FROM subjects s
            JOIN variants v ON v.owner_id = s.owner_id
            WHERE s.owner_id = "#,
        );
        builder.push_bind(owner_id.to_string());

        if filter.require_category {
            builder.push(" AND s.category IS NOT NULL AND s.category != ''");
        }
        if let Some(ids) = filter.subject_ids.as_ref().filter(|ids| !ids.is_empty()) {
            builder.push(" AND s.id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY s.created_at ASC, s.id ASC, v.created_at ASC, v.id ASC LIMIT ");
        builder.push_bind(filter.limit.map_or(-1, |l| l as i64));
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset as i64);

        let rows: Vec<DescriptorRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(DescriptorRow::into_domain).collect())
    }
}

async fn upsert_subject(
    conn: &mut SqliteConnection,
    owner_id: &str,
    subject: &Subject,
) -> Result<(), DbError> {
    let now = Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        INSERT INTO subjects (id, owner_id, name, category, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            owner_id = excluded.owner_id,
            name = excluded.name,
            category = excluded.category,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&subject.id)
    .bind(owner_id)
    .bind(&subject.name)
    .bind(&subject.category)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_variant(
    conn: &mut SqliteConnection,
    owner_id: &str,
    variant: &Variant,
) -> Result<(), DbError> {
    let now = Utc::now().timestamp_millis();
    sqlx::query(
        r#"
        INSERT INTO variants (id, owner_id, name, content, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            owner_id = excluded.owner_id,
            name = excluded.name,
            content = excluded.content,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&variant.id)
    .bind(owner_id)
    .bind(&variant.name)
    .bind(&variant.content)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}
