//! End-to-end tests driving the real, compiled `anqueue-worker` binary
//! through shell-script executors, the same way `anqueue-server` does.

use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anqueue_core::ipc::ParentMessage;
use anqueue_core::manager::{WorkerManager, WorkerManagerOptions};
use anqueue_core::task::Task;
use anqueue_core::worker::TaskInfoEvent;
use tokio::sync::mpsc;

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_anqueue-worker"))
}

fn write_executable_script(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(script.as_bytes()).unwrap();
    #[cfg(unix)]
    {
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
    path
}

const NOOP_EXECUTOR: &str = "#!/bin/sh\nif [ \"$1\" = \"--anqueue-schema\" ]; then\n  echo '{\"retry_patterns\":[],\"rules\":[]}'\nelse\n  cat > /dev/null\n  echo '{\"processed\":true,\"ok\":1}'\nfi\n";

const REJECTING_EXECUTOR: &str = "#!/bin/sh\nif [ \"$1\" = \"--anqueue-schema\" ]; then\n  echo '{\"retry_patterns\":[],\"rules\":[]}'\nelse\n  cat > /dev/null\n  echo '{\"processed\":false}'\nfi\n";

async fn spawn_manager(task_dir: &Path) -> (
    std::sync::Arc<WorkerManager>,
    mpsc::UnboundedReceiver<TaskInfoEvent>,
) {
    let options = WorkerManagerOptions {
        max_concurrent_tasks: 4,
        ..WorkerManagerOptions::new(worker_binary(), task_dir.to_path_buf())
    };
    let (task_info_tx, task_info_rx) = mpsc::unbounded_channel::<TaskInfoEvent>();
    let manager = WorkerManager::new(options, task_info_tx);
    manager.spawn(None).await.expect("worker should spawn");
    // Give the child time to discover its executors before dispatch.
    tokio::time::sleep(Duration::from_millis(300)).await;
    (manager, task_info_rx)
}

/// Happy path (spec §8): a discovered executor completes a task; the
/// worker's `taskInfo` reply carries the executor's result and a final
/// `completed` status.
#[cfg(unix)]
#[tokio::test]
async fn happy_path_single_dispatch_completes_via_real_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_executable_script(dir.path(), "noop", NOOP_EXECUTOR);

    let (manager, mut task_info_rx) = spawn_manager(dir.path()).await;
    let worker = manager.get_available().await.unwrap().expect("a worker should be available");

    let task = Task::new("noop", serde_json::json!({ "x": 1 })).with_uid("t-happy");
    worker.send(ParentMessage::TaskSingle { task: task.to_snapshot().unwrap() }).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), task_info_rx.recv())
        .await
        .expect("worker should reply before the test timeout")
        .expect("channel should not close");

    assert!(event.error.is_none());
    assert_eq!(event.result["ok"], 1);
    assert_eq!(event.task["uid"], "t-happy");
    assert_eq!(event.task["status"], "completed");
}

/// An executor returning `{processed: false}` finalizes as `failed` with no
/// retry attempted (spec §4.1: a clean rejection is not an exception).
#[cfg(unix)]
#[tokio::test]
async fn processed_false_finalizes_failed_without_retry_via_real_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_executable_script(dir.path(), "strict", REJECTING_EXECUTOR);

    let (manager, mut task_info_rx) = spawn_manager(dir.path()).await;
    let worker = manager.get_available().await.unwrap().expect("a worker should be available");

    let task = Task::new("strict", serde_json::json!({})).with_uid("t-fail");
    worker.send(ParentMessage::TaskSingle { task: task.to_snapshot().unwrap() }).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), task_info_rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(event.error.is_none(), "processed:false is a clean reply, not an executor exception");
    assert_eq!(event.task["status"], "failed");
    assert_eq!(event.task["retry_count"], 0);
}

/// `get_info` round-trips through the real IPC framing once a worker has
/// booted: the worker reports its own process id and zero initial load.
#[cfg(unix)]
#[tokio::test]
async fn worker_info_reflects_real_child_process() {
    let dir = tempfile::tempdir().unwrap();
    write_executable_script(dir.path(), "noop", NOOP_EXECUTOR);

    let (manager, _task_info_rx) = spawn_manager(dir.path()).await;
    let worker = manager.get_available().await.unwrap().expect("a worker should be available");

    let info = worker.get_info().await.expect("worker should answer getWorkerInfo");
    assert_eq!(info.process_id, worker.process_id());
    assert_eq!(info.task_load, 0);
    assert_eq!(info.max_load, 4);
}

/// A whole batch of independent tasks against two workers each completes,
/// exercising `dispatch::run_cycle`'s batch strategy over real subprocesses
/// rather than a single `TaskSingle` send.
#[cfg(unix)]
#[tokio::test]
async fn batch_dispatch_completes_every_task_across_two_workers() {
    use anqueue_core::dispatch;
    use anqueue_core::executor::ExecutorRegistry;
    use anqueue_core::store::TaskStore;

    let dir = tempfile::tempdir().unwrap();
    write_executable_script(dir.path(), "noop", NOOP_EXECUTOR);

    let options = WorkerManagerOptions {
        max_workers: 2,
        max_concurrent_tasks: 4,
        ..WorkerManagerOptions::new(worker_binary(), dir.path().to_path_buf())
    };
    let (task_info_tx, mut task_info_rx) = mpsc::unbounded_channel::<TaskInfoEvent>();
    let manager = WorkerManager::new(options, task_info_tx);
    manager.spawn(None).await.unwrap();
    manager.spawn(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let registry = std::sync::Arc::new(ExecutorRegistry::new(dir.path().to_path_buf(), false));
    registry.initialize().await.unwrap();
    let store = std::sync::Arc::new(TaskStore::new());

    let mut tasks: Vec<Task> = (0..8)
        .map(|i| Task::new("noop", serde_json::json!({ "i": i })).with_uid(format!("t-batch-{i}")))
        .collect();

    let counters = dispatch::run_cycle(&mut tasks, &registry, &manager, &store).await;
    assert_eq!(counters.tasks_sent, 8);
    assert!(tasks.is_empty(), "dispatched tasks are removed from the working stack at send time");

    let mut completed = 0;
    for _ in 0..8 {
        let event = tokio::time::timeout(Duration::from_secs(5), task_info_rx.recv())
            .await
            .expect("every dispatched task should reply before the test timeout")
            .expect("channel should not close");
        assert!(event.error.is_none());
        assert_eq!(event.task["status"], "completed");
        completed += 1;
    }
    assert_eq!(completed, 8);
}
