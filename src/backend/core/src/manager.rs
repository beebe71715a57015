//! Owns the worker set: spawn policy, least-loaded selection, crash recovery.
//!
//! Grounded on `orchestrator/worker_pool.rs`'s `WorkerPool` (owns the
//! concurrency primitive, exposes `acquire`/`stats`/`resize`), generalized
//! from a semaphore permit pool to a `DashMap` of owned [`Worker`] handles,
//! plus `jobs/job.rs`'s `BackoffStrategy::Exponential` formula reused verbatim
//! for restart delay (spec.md §4.5).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{ErrorCode, QueueError, Result};
use crate::ipc::ParentMessage;
use crate::worker::{TaskInfoEvent, Worker, WorkerExit, DEFAULT_CACHE_INTERVAL};

const MAX_RESTART_ATTEMPTS: u32 = 5;
const MAX_RESTART_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct WorkerManagerOptions {
    pub binary_path: PathBuf,
    pub task_directory: PathBuf,
    pub worker_prefix: String,
    pub max_workers: u32,
    pub max_concurrent_tasks: u32,
    pub cache_interval: Duration,
}

impl WorkerManagerOptions {
    pub fn new(binary_path: PathBuf, task_directory: PathBuf) -> Self {
        Self {
            binary_path,
            task_directory,
            worker_prefix: "Anqueue-worker-".to_string(),
            max_workers: 3,
            max_concurrent_tasks: 4,
            cache_interval: DEFAULT_CACHE_INTERVAL,
        }
    }
}

/// Owns `workerId → Worker`. Bounded by `max_workers`; IDs are sequential
/// under `worker_prefix`. Exclusively owns the worker map (spec.md §3).
pub struct WorkerManager {
    workers: DashMap<String, Arc<Worker>>,
    options: WorkerManagerOptions,
    next_id: AtomicU64,
    task_info_tx: mpsc::UnboundedSender<TaskInfoEvent>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
}

impl WorkerManager {
    /// Construct the manager and start its crash-supervision loop. Must be
    /// held as an `Arc` since `spawn`/`get_available` recurse through it from
    /// a background task.
    pub fn new(options: WorkerManagerOptions, task_info_tx: mpsc::UnboundedSender<TaskInfoEvent>) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            workers: DashMap::new(),
            options,
            next_id: AtomicU64::new(0),
            task_info_tx,
            exit_tx,
        });

        tokio::spawn(supervise_exits(Arc::downgrade(&manager), exit_rx));
        manager
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn max_workers(&self) -> u32 {
        self.options.max_workers
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.get(id).map(|w| w.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.remove(id).map(|(_, w)| w)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Worker>)) {
        for entry in self.workers.iter() {
            f(entry.value());
        }
    }

    pub fn map<T>(&self, mut f: impl FnMut(&Arc<Worker>) -> T) -> Vec<T> {
        self.workers.iter().map(|entry| f(entry.value())).collect()
    }

    pub fn broadcast(&self, msg: ParentMessage) {
        for entry in self.workers.iter() {
            if let Err(err) = entry.value().send(msg.clone()) {
                tracing::warn!(worker_id = entry.key(), error = %err, "broadcast to worker failed");
            }
        }
    }

    pub async fn close(&self, id: &str, force: bool) -> Result<()> {
        if let Some((_, worker)) = self.workers.remove(id) {
            worker.close(force).await?;
        }
        Ok(())
    }

    /// Refuses when `size >= max_workers`. Launches the worker binary with
    /// `WORKER_ID`/`TASK_DIRECTORY`/`MAX_CONCURRENT_TASKS` bound via the
    /// environment (spec.md §4.5).
    pub async fn spawn(self: &Arc<Self>, id: Option<String>) -> Result<Arc<Worker>> {
        if self.workers.len() as u32 >= self.options.max_workers {
            return Err(QueueError::new(ErrorCode::WorkerSpawnFailed, "worker pool already at max_workers"));
        }

        let id = id.unwrap_or_else(|| self.next_worker_id());
        let worker = Worker::spawn(
            id.clone(),
            &self.options.binary_path,
            &self.options.task_directory,
            self.options.max_concurrent_tasks,
            self.task_info_tx.clone(),
            self.exit_tx.clone(),
        )
        .await?;

        worker.start_refresh_loop(self.options.cache_interval);
        self.workers.insert(id, worker.clone());
        Ok(worker)
    }

    fn next_worker_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}{}", self.options.worker_prefix, n)
    }

    /// Least-loaded worker with `cachedInfo.taskLoad < maxConcurrentTasks`.
    /// Spawns a worker if none exist yet, or if all are saturated and there's
    /// room under `max_workers` (spec.md §4.5).
    pub async fn get_available(self: &Arc<Self>) -> Result<Option<Arc<Worker>>> {
        if self.workers.is_empty() {
            return self.spawn(None).await.map(Some);
        }

        let least_loaded = self
            .workers
            .iter()
            .filter_map(|entry| {
                let worker = entry.value().clone();
                worker.cached_task_load().map(|load| (load, worker))
            })
            .filter(|(load, worker)| *load < worker.max_concurrent_tasks())
            .min_by_key(|(load, _)| *load)
            .map(|(_, worker)| worker);

        if let Some(worker) = least_loaded {
            return Ok(Some(worker));
        }

        if (self.workers.len() as u32) < self.options.max_workers {
            return self.spawn(None).await.map(Some);
        }

        Ok(None)
    }

    /// Workers with spare cached capacity, ascending by current load — the
    /// iteration order `dispatch.rs`'s batch strategy needs (spec.md §4.3).
    /// Never spawns; batch dispatch works with whatever currently exists.
    pub fn available_workers_ascending(&self) -> Vec<Arc<Worker>> {
        let mut loaded: Vec<(u32, Arc<Worker>)> = self
            .workers
            .iter()
            .filter_map(|entry| {
                let worker = entry.value().clone();
                worker.cached_task_load().map(|load| (load, worker))
            })
            .filter(|(load, worker)| *load < worker.max_concurrent_tasks())
            .collect();
        loaded.sort_by_key(|(load, _)| *load);
        loaded.into_iter().map(|(_, worker)| worker).collect()
    }

    /// Sum of `maxConcurrentTasks` across every live worker — the
    /// `totalSlots` denominator in spec.md §4.3's strategy selection.
    pub fn total_slots(&self) -> u32 {
        self.workers.iter().map(|entry| entry.value().max_concurrent_tasks()).sum()
    }
}

async fn supervise_exits(manager: Weak<WorkerManager>, mut exit_rx: mpsc::UnboundedReceiver<WorkerExit>) {
    while let Some(exit) = exit_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };

        manager.workers.remove(&exit.worker_id);

        if exit.is_clean() {
            tracing::info!(worker_id = %exit.worker_id, "worker exited cleanly");
            continue;
        }

        tracing::warn!(
            worker_id = %exit.worker_id,
            code = ?exit.code,
            signal = ?exit.signal,
            "worker crashed; attempting restart with backoff"
        );
        tokio::spawn(restart_with_backoff(manager, exit.worker_id));
    }
}

async fn restart_with_backoff(manager: Arc<WorkerManager>, id: String) {
    for attempt in 0..MAX_RESTART_ATTEMPTS {
        let delay_ms = (1000u64.saturating_mul(1u64 << attempt)).min(MAX_RESTART_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        match manager.spawn(Some(id.clone())).await {
            Ok(_) => {
                tracing::info!(worker_id = %id, attempt, "worker restarted after crash");
                return;
            }
            Err(err) => {
                tracing::warn!(worker_id = %id, attempt, error = %err, "worker restart attempt failed");
            }
        }
    }

    tracing::error!(worker_id = %id, "worker exceeded restart attempts; giving up");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_matches_exponential_backoff_schedule() {
        let delays: Vec<u64> = (0..MAX_RESTART_ATTEMPTS)
            .map(|attempt| (1000u64.saturating_mul(1u64 << attempt)).min(MAX_RESTART_DELAY_MS))
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[tokio::test]
    async fn spawn_refuses_past_max_workers() {
        let options = WorkerManagerOptions {
            max_workers: 0,
            ..WorkerManagerOptions::new(PathBuf::from("/nonexistent/anqueue-worker"), PathBuf::from("/tmp"))
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = WorkerManager::new(options, tx);
        let err = manager.spawn(None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorkerSpawnFailed);
    }
}
