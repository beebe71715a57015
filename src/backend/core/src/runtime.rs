//! Child-side worker runtime: concurrency gate, message loop, executor
//! invocation.
//!
//! Grounded on `jobs/worker.rs`'s `JobWorker`/`WorkerConfig` concurrency-gated
//! loop shape, retargeted from a queue-polling loop onto the IPC message loop
//! spec.md §4.6 describes. The "uncaught error"/"unhandled rejection" process
//! guards from that section are installed once, process-wide, by the
//! `anqueue-worker` binary entry point via `std::panic::set_hook` — there is
//! no runtime-level equivalent to bind inside this struct.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::Result;
use crate::executor::ExecutorRegistry;
use crate::ipc::{line_codec, ChildMessage, ParentMessage, WorkerInfo};
use crate::task::{Executor, Task};

/// Owns the executor registry and the in-flight task count for one worker
/// process. One instance per child (spec.md §4.6).
pub struct WorkerRuntime {
    worker_id: String,
    process_id: u32,
    registry: Arc<ExecutorRegistry>,
    task_load: AtomicU32,
    max_task_load: u32,
    started_at: Instant,
    outbound: mpsc::UnboundedSender<ChildMessage>,
}

impl WorkerRuntime {
    /// Initializes its own `ExecutorRegistry` (built `quiet` so registration
    /// logging stays on the controller only, per spec.md §4.2).
    pub async fn new(
        worker_id: impl Into<String>,
        task_directory: PathBuf,
        max_task_load: u32,
        outbound: mpsc::UnboundedSender<ChildMessage>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(ExecutorRegistry::new(task_directory, true));
        registry.initialize().await?;

        Ok(Arc::new(Self {
            worker_id: worker_id.into(),
            process_id: std::process::id(),
            registry,
            task_load: AtomicU32::new(0),
            max_task_load,
            started_at: Instant::now(),
            outbound,
        }))
    }

    fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id.clone(),
            process_id: self.process_id,
            task_load: self.task_load.load(Ordering::SeqCst),
            max_load: self.max_task_load,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    fn reply(&self, task: serde_json::Value, error: Option<String>, result: serde_json::Value) {
        let _ = self.outbound.send(ChildMessage::TaskInfo {
            task,
            error,
            result,
            worker_id: self.worker_id.clone(),
            process_id: self.process_id,
        });
    }

    /// Dispatch one message from the controller. `taskSingle`/`taskBatch`
    /// spawn their work and return immediately; replies land on `outbound`
    /// asynchronously.
    pub async fn handle(self: &Arc<Self>, msg: ParentMessage) {
        match msg {
            ParentMessage::GetWorkerInfo => {
                let _ = self.outbound.send(ChildMessage::WorkerInfo {
                    data: self.worker_info(),
                    worker_id: self.worker_id.clone(),
                    process_id: self.process_id,
                });
            }
            ParentMessage::SetDatabase { database_url } => {
                tracing::debug!(worker_id = %self.worker_id, attached = database_url.is_some(), "database binding updated");
            }
            ParentMessage::TaskSingle { task } => {
                let runtime = Arc::clone(self);
                tokio::spawn(async move { runtime.run_task(task).await });
            }
            ParentMessage::TaskBatch { batch } => {
                // Every task in a batch runs concurrently with an independent
                // reply as soon as it finishes; results may arrive out of
                // order (spec.md §9's resolved Open Question).
                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|task| {
                        let runtime = Arc::clone(self);
                        tokio::spawn(async move { runtime.run_task(task).await })
                    })
                    .collect();
                futures::future::join_all(handles).await;
            }
        }
    }

    /// Enforce the `MAX_TASK_LOAD` gate, reconstruct the task, look up its
    /// executor, run it, and reply (spec.md §4.6's execution path).
    async fn run_task(self: Arc<Self>, payload: serde_json::Value) {
        let admitted = self
            .task_load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |load| {
                if load >= self.max_task_load {
                    None
                } else {
                    Some(load + 1)
                }
            })
            .is_ok();

        if !admitted {
            self.reply(
                payload,
                Some(format!("worker {} at capacity ({} tasks in flight)", self.worker_id, self.max_task_load)),
                serde_json::Value::Null,
            );
            return;
        }
        let _guard = TaskLoadGuard(&self.task_load);

        let mut task = match Task::from_snapshot(payload.clone()) {
            Ok(task) => task,
            Err(err) => {
                self.reply(payload, Some(err.to_string()), serde_json::Value::Null);
                return;
            }
        };

        let executor = match self.registry.get(&task.task_type) {
            Some(executor) => executor,
            None => {
                let snapshot = task.to_snapshot().unwrap_or(payload);
                self.reply(
                    snapshot,
                    Some(format!("no executor registered for type '{}'", task.task_type)),
                    serde_json::Value::Null,
                );
                return;
            }
        };

        match task.execute(executor.as_ref()).await {
            Ok(result) => {
                executor.on_complete(&task, &result).await;
                let snapshot = task.to_snapshot().unwrap_or(serde_json::Value::Null);
                self.reply(snapshot, None, result);
            }
            Err(err) => {
                executor.on_failure(&task, err.user_message()).await;
                let snapshot = task.to_snapshot().unwrap_or(serde_json::Value::Null);
                self.reply(snapshot, Some(err.user_message().to_string()), serde_json::Value::Null);
            }
        }
    }
}

struct TaskLoadGuard<'a>(&'a AtomicU32);

impl Drop for TaskLoadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run the message loop to completion: frame `stdin` as incoming
/// [`ParentMessage`] lines, dispatch each to `runtime`, and drain
/// `outbound_rx` onto framed `stdout` concurrently. Returns once `stdin`
/// closes (the controller disconnected or exited).
pub async fn run<R, W>(
    runtime: Arc<WorkerRuntime>,
    mut outbound_rx: mpsc::UnboundedReceiver<ChildMessage>,
    stdin: R,
    stdout: W,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(stdout, line_codec());
        while let Some(msg) = outbound_rx.recv().await {
            let line = match serde_json::to_string(&msg) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to serialize reply");
                    continue;
                }
            };
            if framed.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut framed_in = FramedRead::new(stdin, line_codec());
    while let Some(Ok(line)) = framed_in.next().await {
        match serde_json::from_str::<ParentMessage>(&line) {
            Ok(msg) => runtime.handle(msg).await,
            Err(err) => tracing::warn!(error = %err, "malformed message from controller"),
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_tasks_once_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = WorkerRuntime::new("w-test", dir.path().to_path_buf(), 0, tx).await.unwrap();

        runtime.clone().run_task(serde_json::json!({"uid": "t-1", "type": "noop"})).await;

        let msg = rx.recv().await.unwrap();
        match msg {
            ChildMessage::TaskInfo { error, .. } => assert!(error.unwrap().contains("at capacity")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_with_error_when_no_executor_registered() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = WorkerRuntime::new("w-test", dir.path().to_path_buf(), 4, tx).await.unwrap();

        let task = Task::new("unregistered", serde_json::json!({})).to_snapshot().unwrap();
        runtime.clone().run_task(task).await;

        let msg = rx.recv().await.unwrap();
        match msg {
            ChildMessage::TaskInfo { error, .. } => assert!(error.unwrap().contains("no executor registered")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
