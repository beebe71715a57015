//! Persistence adapter contract and its two implementations.
//!
//! Grounded on `jobs/queue.rs`'s `QueueBackend` trait (async_trait boundary,
//! `InMemoryQueueBackend` as the in-memory test double) and `db/mod.rs` (sqlx
//! query style, `PgPoolOptions`), retargeted from job-queue/DAG storage onto
//! the `tasks` table from spec.md §6.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::{ErrorCode, QueueError, Result};

/// Row shape for the `tasks` table (spec.md §3/§6). Primary key: `uid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedTaskRow {
    pub uid: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub data: serde_json::Value,
    pub error: Option<String>,
    pub user_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Abstraction over a persistent store: CRUD plus upsert-with-fallback
/// (spec.md §4.4/§9). Concrete stores implement this trait; no store-specific
/// code leaks past this boundary.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn find_first(&self, uid: &str) -> Result<Option<PersistedTaskRow>>;

    /// Rows whose `status` is in `statuses` and whose `type` is in
    /// `task_types` — the shape `TaskStore::sync_with_db` needs (spec.md
    /// §4.4). An empty `task_types` matches no rows, not every row: that's
    /// the "zero registered executors recover nothing" case sync_with_db
    /// relies on.
    async fn find_many(&self, statuses: &[String], task_types: &[String]) -> Result<Vec<PersistedTaskRow>>;

    async fn create(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow>;

    async fn update(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow>;

    async fn delete(&self, uid: &str) -> Result<()>;

    /// Create `row`; on a unique-constraint conflict, retry as an update of
    /// the same row and return the updated value. Any other error surfaces.
    async fn upsert(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory adapter
// ═══════════════════════════════════════════════════════════════════════════════

/// `DashMap`-backed stand-in, grounded on `jobs/queue.rs`'s
/// `InMemoryQueueBackend`. Used in tests and whenever the queue runs with no
/// external store attached.
#[derive(Default)]
pub struct InMemoryAdapter {
    rows: DashMap<String, PersistedTaskRow>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Adapter for InMemoryAdapter {
    async fn find_first(&self, uid: &str) -> Result<Option<PersistedTaskRow>> {
        Ok(self.rows.get(uid).map(|r| r.clone()))
    }

    async fn find_many(&self, statuses: &[String], task_types: &[String]) -> Result<Vec<PersistedTaskRow>> {
        Ok(self
            .rows
            .iter()
            .filter(|entry| statuses.iter().any(|s| s == &entry.status))
            .filter(|entry| task_types.iter().any(|t| t == &entry.task_type))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn create(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        if self.rows.contains_key(&row.uid) {
            return Err(QueueError::with_internal(
                ErrorCode::DuplicateRecord,
                "task already exists",
                row.uid.clone(),
            ));
        }
        self.rows.insert(row.uid.clone(), row.clone());
        Ok(row)
    }

    async fn update(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        if !self.rows.contains_key(&row.uid) {
            return Err(QueueError::task_not_found(&row.uid));
        }
        self.rows.insert(row.uid.clone(), row.clone());
        Ok(row)
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        self.rows.remove(uid);
        Ok(())
    }

    async fn upsert(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        self.rows.insert(row.uid.clone(), row.clone());
        Ok(row)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres adapter
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference `Adapter` implementation over `sqlx::PgPool`, grounded on
/// `db/mod.rs`'s query style.
pub struct PgAdapter {
    pool: PgPool,
}

impl PgAdapter {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_from_sqlx(row: &sqlx::postgres::PgRow) -> std::result::Result<PersistedTaskRow, sqlx::Error> {
        Ok(PersistedTaskRow {
            uid: row.try_get("uid")?,
            task_type: row.try_get("type")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            data: row.try_get("data")?,
            error: row.try_get("error")?,
            user_id: row.try_get("user_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("finished_at")?,
        })
    }
}

#[async_trait]
impl Adapter for PgAdapter {
    async fn find_first(&self, uid: &str) -> Result<Option<PersistedTaskRow>> {
        let row = sqlx::query(
            r#"SELECT uid, type, name, description, status, data, error, user_id, started_at, finished_at
               FROM tasks WHERE uid = $1"#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_from_sqlx(&r).map_err(QueueError::from)).transpose()
    }

    async fn find_many(&self, statuses: &[String], task_types: &[String]) -> Result<Vec<PersistedTaskRow>> {
        let rows = sqlx::query(
            r#"SELECT uid, type, name, description, status, data, error, user_id, started_at, finished_at
               FROM tasks
               WHERE status = ANY($1)
                 AND type = ANY($2)"#,
        )
        .bind(statuses)
        .bind(task_types)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| Self::row_from_sqlx(r).map_err(QueueError::from)).collect()
    }

    async fn create(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        sqlx::query(
            r#"INSERT INTO tasks (uid, type, name, description, status, data, error, user_id, started_at, finished_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&row.uid)
        .bind(&row.task_type)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.status)
        .bind(&row.data)
        .bind(&row.error)
        .bind(&row.user_id)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        sqlx::query(
            r#"UPDATE tasks SET type = $2, name = $3, description = $4, status = $5,
                   data = $6, error = $7, user_id = $8, started_at = $9, finished_at = $10
               WHERE uid = $1"#,
        )
        .bind(&row.uid)
        .bind(&row.task_type)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.status)
        .bind(&row.data)
        .bind(&row.error)
        .bind(&row.user_id)
        .bind(row.started_at)
        .bind(row.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE uid = $1").bind(uid).execute(&self.pool).await?;
        Ok(())
    }

    /// Try `create`; if the database reports a unique-constraint conflict
    /// (Postgres code `23505`, resolving spec.md's Open Question about the
    /// ambiguous `"P202"`/`"P2002"` literal by not depending on either),
    /// retry as `update`. Any other error surfaces unchanged.
    async fn upsert(&self, row: PersistedTaskRow) -> Result<PersistedTaskRow> {
        match self.create(row.clone()).await {
            Ok(created) => Ok(created),
            Err(err) if err.code() == ErrorCode::DuplicateRecord => self.update(row).await,
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(uid: &str) -> PersistedTaskRow {
        PersistedTaskRow {
            uid: uid.to_string(),
            task_type: "noop".to_string(),
            name: "demo".to_string(),
            description: None,
            status: "pending".to_string(),
            data: serde_json::json!({}),
            error: None,
            user_id: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn in_memory_upsert_is_idempotent() {
        let adapter = InMemoryAdapter::new();
        let row = sample_row("t-1");

        adapter.upsert(row.clone()).await.unwrap();
        let mut updated = row.clone();
        updated.status = "completed".to_string();
        adapter.upsert(updated.clone()).await.unwrap();

        let found = adapter.find_first("t-1").await.unwrap().unwrap();
        assert_eq!(found.status, "completed");
        assert_eq!(adapter.find_many(&["completed".to_string()], &["noop".to_string()]).await.unwrap().len(), 1);
        assert!(adapter.find_many(&["completed".to_string()], &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_create_conflict_is_duplicate_record() {
        let adapter = InMemoryAdapter::new();
        adapter.create(sample_row("t-2")).await.unwrap();
        let err = adapter.create(sample_row("t-2")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
    }

    #[tokio::test]
    async fn in_memory_delete_removes_row() {
        let adapter = InMemoryAdapter::new();
        adapter.create(sample_row("t-3")).await.unwrap();
        adapter.delete("t-3").await.unwrap();
        assert!(adapter.find_first("t-3").await.unwrap().is_none());
    }
}
