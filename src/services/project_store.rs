//! src/services/project_store.rs
//!
//! Row persistence for projects. [`ProjectStore`] is the seam the registry is
//! built against; [`SqliteProjectStore`] is the production implementation.

use crate::models::project::{NewProject, Project};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqlitePool, migrate::Migrator};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Schema from `migrations/`, embedded at build time.
static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identifier `{0}` is already in use")]
    Duplicate(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Exact-match lookup on `identifier`.
    async fn find_by_identifier(&self, identifier: &str) -> StoreResult<Option<Project>>;

    /// Insert and commit a row in one transaction, returning it as stored.
    ///
    /// A uniqueness violation on `identifier` yields `StoreError::Duplicate`.
    async fn insert(&self, project: NewProject) -> StoreResult<Project>;

    /// Number of project rows.
    async fn count(&self) -> StoreResult<i64>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// SQLite-backed project rows.
#[derive(Clone)]
pub struct SqliteProjectStore {
    db: Arc<SqlitePool>,
}

impl SqliteProjectStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn find_by_identifier(&self, identifier: &str) -> StoreResult<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            "SELECT id, identifier, created_at, storage_class, storage_key
             FROM projects WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&*self.db)
        .await?;
        Ok(project)
    }

    async fn insert(&self, project: NewProject) -> StoreResult<Project> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (identifier, created_at, storage_class, storage_key)
            VALUES (?, ?, ?, ?)
            RETURNING id, identifier, created_at, storage_class, storage_key
            "#,
        )
        .bind(&project.identifier)
        .bind(stored_timestamp(&project.created_at))
        .bind(&project.storage_class)
        .bind(&project.storage_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Duplicate(project.identifier.clone())
            } else {
                StoreError::Database(err)
            }
        })?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn count(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM projects")
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Apply pending migrations. Already applied ones are skipped.
pub async fn migrate(db: &SqlitePool) -> StoreResult<()> {
    info!("Running {} migrations...", MIGRATOR.iter().count());
    MIGRATOR.run(db).await?;
    Ok(())
}

/// RFC 3339 text with nine fractional digits and a `Z` suffix.
///
/// The column default in the schema produces the same fixed-width shape, so
/// text order on `created_at` is chronological order.
fn stored_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory database with the schema applied.
    pub(crate) async fn memory_pool() -> Arc<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        Arc::new(pool)
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let store = SqliteProjectStore::new(memory_pool().await);
        let first = store
            .insert(NewProject::new("AAAAAAAAAAAA", "local"))
            .await
            .unwrap();
        let second = store
            .insert(NewProject::new("BBBBBBBBBBBB", "local"))
            .await
            .unwrap();

        assert!(second.id > first.id);
        assert_eq!(first.storage_key.as_deref(), Some("AAAAAAAAAAAA.zip"));
        assert_eq!(first.storage_class.as_deref(), Some("local"));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn find_returns_inserted_row() {
        let store = SqliteProjectStore::new(memory_pool().await);
        let inserted = store
            .insert(NewProject::new("CCCCCCCCCCCC", "local"))
            .await
            .unwrap();

        let found = store.find_by_identifier("CCCCCCCCCCCC").await.unwrap();
        assert_eq!(found, Some(inserted));
        assert_eq!(store.find_by_identifier("DDDDDDDDDDDD").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_classified() {
        let store = SqliteProjectStore::new(memory_pool().await);
        store
            .insert(NewProject::new("EEEEEEEEEEEE", "local"))
            .await
            .unwrap();

        let err = store
            .insert(NewProject::new("EEEEEEEEEEEE", "local"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(ref id) if id == "EEEEEEEEEEEE"));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn schema_rejects_wrong_length_identifiers() {
        let store = SqliteProjectStore::new(memory_pool().await);
        let err = store
            .insert(NewProject::new("short", "local"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn created_at_text_matches_schema_default() {
        let pool = memory_pool().await;
        let store = SqliteProjectStore::new(pool.clone());

        sqlx::query("INSERT INTO projects (identifier) VALUES ('XXXXXXXXXXXX')")
            .execute(&*pool)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .insert(NewProject::new("YYYYYYYYYYYY", "local"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sqlx::query("INSERT INTO projects (identifier) VALUES ('ZZZZZZZZZZZZ')")
            .execute(&*pool)
            .await
            .unwrap();

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT identifier, created_at FROM projects ORDER BY created_at")
                .fetch_all(&*pool)
                .await
                .unwrap();
        let order: Vec<&str> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, ["XXXXXXXXXXXX", "YYYYYYYYYYYY", "ZZZZZZZZZZZZ"]);
        for (id, text) in &rows {
            assert_eq!(text.len(), "2026-01-01T00:00:00.000000000Z".len(), "{id}: {text}");
            assert!(text.ends_with('Z'), "{id}: {text}");
        }

        let defaulted = store.find_by_identifier("XXXXXXXXXXXX").await.unwrap().unwrap();
        let inserted = store.find_by_identifier("YYYYYYYYYYYY").await.unwrap().unwrap();
        assert!(defaulted.created_at < inserted.created_at);
        assert_eq!(defaulted.storage_key, None);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();
        SqliteProjectStore::new(pool).health_check().await.unwrap();
    }
}
