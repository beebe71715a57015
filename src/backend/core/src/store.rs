//! Task persistence: optional adapter, recovery sync, and save-on-reply.
//!
//! Grounded on `jobs/queue.rs`'s optional-backend pattern (a queue that works
//! with no backend attached, upgrading to durable behavior once one is set)
//! and `db/mod.rs`'s once-per-process warning for a missing table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::adapter::{Adapter, PersistedTaskRow};
use crate::error::{ErrorCode, Result};
use crate::task::{Task, TaskStatus};

/// Wraps an optional [`Adapter`] and implements the two operations the
/// controller drives it with: `sync_with_db` (recovery on startup / each
/// cycle) and `save_task` (persist a worker's reply). With no adapter
/// attached, both are inert (spec.md §4.4's "the store is inert").
///
/// The adapter slot is guarded by a plain `RwLock` rather than an async one:
/// every method clones the `Arc<dyn Adapter>` out and drops the guard before
/// awaiting it, so a `&TaskStore` can be shared and driven concurrently
/// without ever holding a lock across an await point.
pub struct TaskStore {
    adapter: RwLock<Option<Arc<dyn Adapter>>>,
    reported_missing_table: AtomicBool,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self { adapter: RwLock::new(None), reported_missing_table: AtomicBool::new(false) }
    }

    pub fn set_adapter(&self, adapter: Arc<dyn Adapter>) {
        *self.adapter.write() = Some(adapter);
        self.reported_missing_table.store(false, Ordering::SeqCst);
    }

    pub fn adapter(&self) -> Option<Arc<dyn Adapter>> {
        self.adapter.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.adapter.read().is_some()
    }

    /// Pull `pending` rows whose `type` is registered and whose `uid` is not
    /// already held in memory, reconstructed as fresh [`Task`]s ready to
    /// re-enter the stack. A missing `tasks` table is reported once, not on
    /// every cycle.
    pub async fn sync_with_db(&self, registered_types: &[String], known_uids: &HashSet<String>) -> Vec<Task> {
        let Some(adapter) = self.adapter() else {
            return Vec::new();
        };

        let rows = match adapter.find_many(&["pending".to_string()], registered_types).await {
            Ok(rows) => rows,
            Err(err) => {
                if err.code() == ErrorCode::AdapterError {
                    if !self.reported_missing_table.swap(true, Ordering::SeqCst) {
                        tracing::warn!(error = %err, "tasks table unavailable; skipping sync");
                    }
                } else {
                    err.log();
                }
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter(|row| !known_uids.contains(&row.uid))
            .map(row_to_task)
            .collect()
    }

    /// Persist a worker's reply. `result` (when present) is merged into the
    /// stored `data`, with the `processed` flag stripped first (spec.md §4.4).
    /// Returns `true` iff the task should now be dropped from the in-memory
    /// stack (i.e. its status is `completed`).
    pub async fn save_task(&self, task: &Task, result: Option<&serde_json::Value>) -> bool {
        let Some(adapter) = self.adapter() else {
            return task.status == TaskStatus::Completed;
        };

        let data = match result {
            Some(result) => strip_processed_flag(result.clone()),
            None => task.data.clone(),
        };

        let row = PersistedTaskRow {
            uid: task.uid.clone(),
            task_type: task.task_type.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
            status: task.status.to_string(),
            data,
            error: task.error.clone(),
            user_id: task.user_id.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
        };

        match adapter.upsert(row).await {
            Ok(_) => task.status == TaskStatus::Completed,
            Err(err) => {
                err.log();
                false
            }
        }
    }
}

fn row_to_task(row: PersistedTaskRow) -> Task {
    let mut task = Task::new(row.task_type, row.data).with_uid(row.uid).with_name(row.name);
    task.description = row.description;
    task
}

fn strip_processed_flag(mut value: serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("processed");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryAdapter;

    #[tokio::test]
    async fn inert_without_adapter() {
        let store = TaskStore::new();
        assert!(!store.is_attached());
        let task = Task::new("noop", serde_json::json!({}));
        assert!(!store.save_task(&task, None).await);
        assert!(store.sync_with_db(&["noop".to_string()], &HashSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn save_task_strips_processed_flag_from_persisted_data() {
        let store = TaskStore::new();
        let adapter = Arc::new(InMemoryAdapter::new());
        store.set_adapter(adapter.clone());

        let mut task = Task::new("noop", serde_json::json!({})).with_uid("t-1");
        task.status = TaskStatus::Completed;
        let result = serde_json::json!({ "processed": true, "ok": 1 });

        let should_remove = store.save_task(&task, Some(&result)).await;
        assert!(should_remove);

        let row = adapter.find_first("t-1").await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.data.get("processed").is_none());
        assert_eq!(row.data["ok"], 1);
    }

    #[tokio::test]
    async fn sync_with_db_skips_uids_already_in_memory() {
        let store = TaskStore::new();
        let adapter = Arc::new(InMemoryAdapter::new());
        store.set_adapter(adapter.clone());

        adapter
            .create(PersistedTaskRow {
                uid: "t-2".to_string(),
                task_type: "noop".to_string(),
                name: "demo".to_string(),
                description: None,
                status: "pending".to_string(),
                data: serde_json::json!({}),
                error: None,
                user_id: None,
                started_at: None,
                completed_at: None,
            })
            .await
            .unwrap();

        let known: HashSet<String> = ["t-2".to_string()].into_iter().collect();
        let recovered = store.sync_with_db(&["noop".to_string()], &known).await;
        assert!(recovered.is_empty());

        let recovered = store.sync_with_db(&["noop".to_string()], &HashSet::new()).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].uid, "t-2");
    }
}
