//! `Queue`: the public-facing facade wiring every other module together.
//!
//! Grounded on `jobs/mod.rs`, the teacher's module composition root that
//! wires `JobQueue` + `JobScheduler` + `JobWorker` together behind one
//! surface — generalized here into the single `Queue` type spec.md §6
//! describes, which owns the in-memory task stack and the worker manager
//! exclusively (spec.md §3's ownership rule).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::adapter::Adapter;
use crate::dispatch::{self, DispatchCounters};
use crate::error::{ErrorCode, QueueError, Result};
use crate::executor::ExecutorRegistry;
use crate::glue;
use crate::manager::{WorkerManager, WorkerManagerOptions};
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};
use crate::worker::TaskInfoEvent;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub id: Option<String>,
    pub worker_prefix: Option<String>,
    pub max_workers: Option<u32>,
    pub max_concurrent_tasks: u32,
    pub cache_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            id: None,
            worker_prefix: None,
            max_workers: None,
            max_concurrent_tasks: 4,
            cache_interval: crate::worker::DEFAULT_CACHE_INTERVAL,
        }
    }
}

/// The controller's public API (spec.md §6). Owns the in-memory task stack
/// and the worker set exclusively; no other component mutates either.
pub struct Queue {
    id: String,
    task_directory: PathBuf,
    tasks: RwLock<Vec<Task>>,
    registry: Arc<ExecutorRegistry>,
    manager: Arc<WorkerManager>,
    store: Arc<TaskStore>,
    initialized: AtomicBool,
}

impl Queue {
    /// `taskDir` is the only required input; see [`QueueOptions`] for the
    /// rest of spec.md §6's constructor defaults (`id="Anqueue"`,
    /// `workerPrefix="{id}-worker-"`, `maxWorkers=3`).
    pub fn new(task_directory: impl Into<PathBuf>, options: QueueOptions) -> Result<Arc<Self>> {
        let task_directory = task_directory.into();
        let id = options.id.unwrap_or_else(|| "Anqueue".to_string());
        let worker_prefix = options.worker_prefix.unwrap_or_else(|| format!("{id}-worker-"));
        let max_workers = options.max_workers.unwrap_or(3);

        let binary_path = resolve_worker_binary()?;
        let manager_options = WorkerManagerOptions {
            binary_path,
            task_directory: task_directory.clone(),
            worker_prefix,
            max_workers,
            max_concurrent_tasks: options.max_concurrent_tasks,
            cache_interval: options.cache_interval,
        };

        let registry = Arc::new(ExecutorRegistry::new(task_directory.clone(), false));
        let store = Arc::new(TaskStore::new());

        let (task_info_tx, task_info_rx) = mpsc::unbounded_channel();
        let manager = WorkerManager::new(manager_options, task_info_tx);

        tokio::spawn(process_task_info(registry.clone(), store.clone(), task_info_rx));

        Ok(Arc::new(Self {
            id,
            task_directory,
            tasks: RwLock::new(Vec::new()),
            registry,
            manager,
            store,
            initialized: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Discover executors and spawn one worker. A no-op on every call after
    /// the first (spec.md §6).
    pub async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.registry.initialize().await?;

        let fingerprint = glue::directory_fingerprint(&self.task_directory).await?;
        if glue::read_cached_fingerprint(&self.task_directory).await.as_deref() != Some(fingerprint.as_str()) {
            tracing::info!(task_directory = %self.task_directory.display(), "task directory changed since last run");
            glue::write_cached_fingerprint(&self.task_directory, &fingerprint).await;
        }

        self.manager.spawn(None).await?;
        Ok(())
    }

    pub fn set_database(&self, adapter: Arc<dyn Adapter>) {
        self.store.set_adapter(adapter);
    }

    pub fn add(self: &Arc<Self>, task: Task) -> Arc<Self> {
        self.tasks.write().push(task);
        self.clone()
    }

    /// Splice `uid` out of the stack. `silent` suppresses the removal log
    /// line (spec.md §6).
    pub fn remove(&self, uid: &str, silent: bool) -> bool {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|t| t.uid != uid);
        let removed = tasks.len() < before;
        if removed && !silent {
            tracing::info!(uid = %uid, "task removed from queue");
        }
        removed
    }

    /// `task.cancel()` then remove (spec.md §6).
    pub fn cancel(&self, uid: &str) -> bool {
        let cancelled = {
            let mut tasks = self.tasks.write();
            match tasks.iter_mut().find(|t| t.uid == uid) {
                Some(task) => task.cancel().is_ok(),
                None => false,
            }
        };
        if cancelled {
            self.remove(uid, true);
        }
        cancelled
    }

    pub fn get_task(&self, uid: &str) -> Option<Task> {
        self.tasks.read().iter().find(|t| t.uid == uid).cloned()
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    pub fn get_pending_tasks(&self) -> Vec<Task> {
        self.tasks.read().iter().filter(|t| t.ready_to_run()).cloned().collect()
    }

    pub fn get_task_statuses(&self) -> HashMap<String, TaskStatus> {
        self.tasks.read().iter().map(|t| (t.uid.clone(), t.status)).collect()
    }

    pub fn clear(&self) {
        self.tasks.write().clear();
    }

    /// Stable priority sort of the in-memory stack (spec.md §4.3, §6).
    pub fn schedule_tasks(&self) {
        dispatch::sort_by_priority(&mut self.tasks.write());
    }

    /// One dispatch cycle over `tasks`, or the whole in-memory stack if
    /// `None` (spec.md §6).
    pub async fn run_tasks(&self, tasks: Option<Vec<Task>>) -> DispatchCounters {
        match tasks {
            Some(explicit) => {
                let explicit_uids: std::collections::HashSet<String> = explicit.iter().map(|t| t.uid.clone()).collect();
                let mut working = explicit;
                let counters = dispatch::run_cycle(&mut working, &self.registry, &self.manager, &self.store).await;

                let mut stack = self.tasks.write();
                stack.retain(|t| !explicit_uids.contains(&t.uid));
                stack.extend(working);
                counters
            }
            None => {
                let mut stack = self.tasks.write();
                dispatch::run_cycle(&mut stack, &self.registry, &self.manager, &self.store).await
            }
        }
    }

    /// Infinite loop: sync from the store, dispatch ready tasks, sleep
    /// `timeout_seconds` (spec.md §6). Runs until the process exits.
    pub async fn run_automatically(self: Arc<Self>, timeout_seconds: u64) -> ! {
        loop {
            let registered_types = self.registry.registered_types();
            let known_uids: std::collections::HashSet<String> =
                self.tasks.read().iter().map(|t| t.uid.clone()).collect();
            let recovered = self.store.sync_with_db(&registered_types, &known_uids).await;
            if !recovered.is_empty() {
                tracing::info!(count = recovered.len(), "recovered pending tasks from store");
                self.tasks.write().extend(recovered);
            }

            let counters = self.run_tasks(None).await;
            tracing::debug!(
                tasks_sent = counters.tasks_sent,
                no_worker_available = counters.no_worker_available,
                no_executor_found = counters.no_executor_found,
                validation_failed = counters.validation_failed,
                "dispatch cycle complete"
            );

            tokio::time::sleep(Duration::from_secs(timeout_seconds)).await;
        }
    }
}

/// Drains `TaskInfoEvent`s from every worker: persists via the store, then
/// invokes the executor's `save_result` hook with the adapter the store
/// persisted through, if any (spec.md §4.5). Tasks are already gone from the
/// in-memory stack by this point — `dispatch.rs` removes them at send time,
/// not at reply time.
async fn process_task_info(registry: Arc<ExecutorRegistry>, store: Arc<TaskStore>, mut rx: mpsc::UnboundedReceiver<TaskInfoEvent>) {
    while let Some(event) = rx.recv().await {
        let task = match Task::from_snapshot(event.task.clone()) {
            Ok(task) => task,
            Err(err) => {
                err.log();
                continue;
            }
        };

        let result_for_store = if event.error.is_none() { Some(&event.result) } else { None };
        store.save_task(&task, result_for_store).await;

        if let Some(executor) = registry.get(&task.task_type) {
            executor.save_result(&task, store.adapter()).await;
        }
    }
}

/// Locate the `anqueue-worker` binary next to the current executable, the
/// same way `cargo` resolves `cargo-*` subcommands on `PATH` (spec.md §4.5:
/// "failure to locate the runtime binary is fatal to the caller").
fn resolve_worker_binary() -> Result<PathBuf> {
    let current_exe = std::env::current_exe()
        .map_err(|e| QueueError::with_internal(ErrorCode::WorkerSpawnFailed, "could not resolve current executable", e.to_string()))?;
    let dir = current_exe.parent().unwrap_or_else(|| Path::new("."));

    let name = if cfg!(windows) { "anqueue-worker.exe" } else { "anqueue-worker" };
    let candidate = dir.join(name);

    if candidate.exists() {
        return Ok(candidate);
    }

    Err(QueueError::new(
        ErrorCode::WorkerSpawnFailed,
        format!("worker runtime binary not found next to {}", current_exe.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_task_statuses_reflects_current_stack() {
        let tasks = vec![
            Task::new("a", serde_json::json!({})).with_uid("t-1"),
            Task::new("b", serde_json::json!({})).with_uid("t-2"),
        ];
        let statuses: HashMap<String, TaskStatus> = tasks.iter().map(|t| (t.uid.clone(), t.status)).collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["t-1"], TaskStatus::Pending);
    }
}
