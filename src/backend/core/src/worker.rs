//! Parent-side handle onto one worker child process.
//!
//! Grounded on `orchestrator/worker_pool.rs`'s permit/stats bookkeeping idiom
//! (counters and `Instant`-based timing, generalized here from an in-process
//! semaphore permit to a real `tokio::process::Child`) and `jobs/job.rs`'s
//! `BackoffStrategy::Exponential`, whose delay formula is reused verbatim for
//! worker restart backoff in `manager.rs`.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::{ErrorCode, QueueError, Result};
use crate::ipc::{line_codec, ChildMessage, ParentMessage, WorkerInfo};

const GET_INFO_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_CACHE_INTERVAL: Duration = Duration::from_millis(200);

// On Unix, clean-shutdown signals a worker may have received before exiting.
#[cfg(unix)]
const SIGINT: i32 = 2;
#[cfg(unix)]
const SIGTERM: i32 = 15;

/// A `taskInfo` reply surfaced by a worker, routed to whoever owns the store
/// and executor registry (the `Queue` facade) rather than handled here —
/// `Worker` only knows how to talk to its child, not how to persist results.
#[derive(Debug, Clone)]
pub struct TaskInfoEvent {
    pub worker_id: String,
    pub task: serde_json::Value,
    pub error: Option<String>,
    pub result: serde_json::Value,
}

/// Reported once a worker's child process exits, clean or not.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub worker_id: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// `code == 0`, or terminated by `SIGTERM`/`SIGINT` — spec.md §4.5's
    /// "clean exits... remove the handle and stop" (no restart).
    pub fn is_clean(&self) -> bool {
        matches!(self.code, Some(0)) || self.is_clean_signal()
    }

    #[cfg(unix)]
    fn is_clean_signal(&self) -> bool {
        matches!(self.signal, Some(SIGTERM) | Some(SIGINT))
    }

    #[cfg(not(unix))]
    fn is_clean_signal(&self) -> bool {
        false
    }
}

/// Handle onto one worker's OS process plus its cached vitals. Exclusively
/// owned by a `WorkerManager` (spec.md §3 ownership rule).
pub struct Worker {
    id: String,
    process_id: u32,
    child: Arc<tokio::sync::Mutex<Child>>,
    outbound: mpsc::UnboundedSender<ParentMessage>,
    cached_info: Arc<RwLock<Option<WorkerInfo>>>,
    pending_info: Arc<Mutex<Option<oneshot::Sender<WorkerInfo>>>>,
    spawned_at: Instant,
    max_concurrent_tasks: u32,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Launch `binary` as a child, wiring its stdio to the framed IPC
    /// protocol in `ipc.rs`. `task_info_tx`/`exit_tx` are owned by the caller
    /// (normally a `WorkerManager`) and fed by background tasks for the
    /// lifetime of the child.
    pub async fn spawn(
        id: impl Into<String>,
        binary: &Path,
        task_directory: &Path,
        max_concurrent_tasks: u32,
        task_info_tx: mpsc::UnboundedSender<TaskInfoEvent>,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Arc<Worker>> {
        let id = id.into();

        let mut child = Command::new(binary)
            .env("WORKER_ID", &id)
            .env("TASK_DIRECTORY", task_directory)
            .env("MAX_CONCURRENT_TASKS", max_concurrent_tasks.to_string())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                QueueError::with_internal(ErrorCode::WorkerSpawnFailed, "failed to spawn worker process", e.to_string())
            })?;

        let process_id = child.id().unwrap_or(0);
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending_info: Arc<Mutex<Option<oneshot::Sender<WorkerInfo>>>> = Arc::new(Mutex::new(None));
        let cached_info: Arc<RwLock<Option<WorkerInfo>>> = Arc::new(RwLock::new(None));

        tokio::spawn(writer_loop(stdin, outbound_rx));
        tokio::spawn(reader_loop(stdout, id.clone(), pending_info.clone(), cached_info.clone(), task_info_tx));
        tokio::spawn(stderr_log_loop(stderr, id.clone()));

        let child = Arc::new(tokio::sync::Mutex::new(child));
        tokio::spawn(exit_loop(child.clone(), id.clone(), exit_tx));

        Ok(Arc::new(Worker {
            id,
            process_id,
            child,
            outbound: outbound_tx,
            cached_info,
            pending_info,
            spawned_at: Instant::now(),
            max_concurrent_tasks,
            refresh_handle: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn max_concurrent_tasks(&self) -> u32 {
        self.max_concurrent_tasks
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Drop outbound messages without an `event` tag would be spec.md §4.5's
    /// rule; every `ParentMessage` variant carries one by construction via
    /// `#[serde(tag = "event")]`, so there is nothing to filter here.
    pub fn send(&self, msg: ParentMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| QueueError::new(ErrorCode::WorkerUnresponsive, "worker stdin channel closed"))
    }

    /// Request/response with a 5000 ms timeout; caches the result.
    pub async fn get_info(&self) -> Result<WorkerInfo> {
        let (tx, rx) = oneshot::channel();
        *self.pending_info.lock() = Some(tx);
        self.send(ParentMessage::GetWorkerInfo)?;

        let info = tokio::time::timeout(GET_INFO_TIMEOUT, rx)
            .await
            .map_err(|_| QueueError::new(ErrorCode::WorkerUnresponsive, "worker did not reply to getWorkerInfo"))?
            .map_err(|_| QueueError::internal("worker info channel closed before reply"))?;

        *self.cached_info.write() = Some(info.clone());
        Ok(info)
    }

    /// Most recent `WorkerInfo`, or `None` if never polled. Callers must
    /// treat `None` as "do not consider available" (spec.md §9).
    pub fn cached_info(&self) -> Option<WorkerInfo> {
        self.cached_info.read().clone()
    }

    pub fn cached_task_load(&self) -> Option<u32> {
        self.cached_info().map(|i| i.task_load)
    }

    /// Start the periodic `cachedInfo` refresher. Call once, right after
    /// construction; aborted by `close`.
    pub fn start_refresh_loop(self: &Arc<Self>, interval: Duration) {
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = worker.get_info().await {
                    tracing::debug!(worker_id = %worker.id, error = %err, "periodic worker info refresh failed");
                }
            }
        });
        *self.refresh_handle.lock() = Some(handle);
    }

    /// Detach the refresh loop and, if `force`, kill the OS process. The IPC
    /// channel is dropped along with `self`.
    pub async fn close(&self, force: bool) -> Result<()> {
        if let Some(handle) = self.refresh_handle.lock().take() {
            handle.abort();
        }
        if force {
            let mut child = self.child.lock().await;
            let _ = child.start_kill();
        }
        Ok(())
    }
}

async fn writer_loop(stdin: tokio::process::ChildStdin, mut rx: mpsc::UnboundedReceiver<ParentMessage>) {
    let mut framed = FramedWrite::new(stdin, line_codec());
    while let Some(msg) = rx.recv().await {
        let line = match serde_json::to_string(&msg) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize outbound worker message");
                continue;
            }
        };
        if framed.send(line).await.is_err() {
            break;
        }
    }
}

async fn reader_loop(
    stdout: tokio::process::ChildStdout,
    worker_id: String,
    pending_info: Arc<Mutex<Option<oneshot::Sender<WorkerInfo>>>>,
    cached_info: Arc<RwLock<Option<WorkerInfo>>>,
    task_info_tx: mpsc::UnboundedSender<TaskInfoEvent>,
) {
    let mut framed = FramedRead::new(stdout, line_codec());
    while let Some(Ok(line)) = framed.next().await {
        let message: ChildMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(worker_id = %worker_id, error = %err, "malformed message from worker");
                continue;
            }
        };

        match message {
            ChildMessage::WorkerInfo { data, .. } => {
                *cached_info.write() = Some(data.clone());
                if let Some(tx) = pending_info.lock().take() {
                    let _ = tx.send(data);
                }
            }
            ChildMessage::TaskInfo { task, error, result, .. } => {
                let _ = task_info_tx.send(TaskInfoEvent { worker_id: worker_id.clone(), task, error, result });
            }
        }
    }
    tracing::debug!(worker_id = %worker_id, "worker stdout closed");
}

async fn stderr_log_loop(stderr: tokio::process::ChildStderr, worker_id: String) {
    let mut framed = FramedRead::new(stderr, line_codec());
    while let Some(Ok(line)) = framed.next().await {
        tracing::warn!(worker_id = %worker_id, "{line}");
    }
}

async fn exit_loop(child: Arc<tokio::sync::Mutex<Child>>, worker_id: String, exit_tx: mpsc::UnboundedSender<WorkerExit>) {
    let status = {
        let mut guard = child.lock().await;
        guard.wait().await
    };

    let exit = match status {
        Ok(status) => WorkerExit {
            worker_id: worker_id.clone(),
            code: status.code(),
            signal: unix_signal(&status),
        },
        Err(err) => {
            tracing::error!(worker_id = %worker_id, error = %err, "failed to wait on worker process");
            WorkerExit { worker_id: worker_id.clone(), code: None, signal: None }
        }
    };

    let _ = exit_tx.send(exit);
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    std::os::unix::process::ExitStatusExt::signal(status)
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_codes_are_recognized() {
        let exit = WorkerExit { worker_id: "w-1".into(), code: Some(0), signal: None };
        assert!(exit.is_clean());

        let crash = WorkerExit { worker_id: "w-1".into(), code: Some(1), signal: None };
        assert!(!crash.is_clean());
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_and_sigint_count_as_clean() {
        let sigterm = WorkerExit { worker_id: "w-1".into(), code: None, signal: Some(SIGTERM) };
        assert!(sigterm.is_clean());
        let sigkill = WorkerExit { worker_id: "w-1".into(), code: None, signal: Some(9) };
        assert!(!sigkill.is_clean());
    }
}
