//! `anqueue-worker` — the child-process entry point `WorkerManager::spawn`
//! launches (spec.md §4.6).
//!
//! Grounded on `jobs/worker.rs`'s standalone worker-process startup: install
//! the uncaught-error/unhandled-rejection-equivalent guards first (a panic
//! anywhere in this process logs and exits with code 1, since a half-alive
//! worker is worse than a restarted one), then build a `WorkerRuntime` from
//! the environment bindings `WorkerManager::spawn` sets and run its message
//! loop over stdin/stdout.

use std::path::PathBuf;

use anqueue_core::ipc::ChildMessage;
use anqueue_core::runtime::{self, WorkerRuntime};
use anqueue_core::telemetry::{init_logging, LogFormat, LoggingConfig};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    install_panic_guard();

    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| "anqueue-worker-0".to_string());
    let task_directory = std::env::var("TASK_DIRECTORY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./tasks"));
    let max_task_load: u32 = std::env::var("MAX_CONCURRENT_TASKS").ok().and_then(|v| v.parse().ok()).unwrap_or(4);

    // Worker stdout is the IPC channel to the controller; logs go to stderr
    // only, and stay quiet unless explicitly raised (spec.md §4.2's "keep
    // worker stdout quiet").
    let _ = init_logging(&LoggingConfig { level: "warn".to_string(), format: LogFormat::Pretty });

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<ChildMessage>();

    let runtime = match WorkerRuntime::new(worker_id.clone(), task_directory, max_task_load, outbound_tx).await {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("anqueue-worker {worker_id}: failed to initialize: {err}");
            std::process::exit(1);
        }
    };

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    runtime::run(runtime, outbound_rx, stdin, stdout).await;
}

/// Install a panic hook that logs and exits with code 1, the Rust analogue
/// of spec.md §4.6's "uncaught error"/"unhandled rejection" process guards —
/// a worker that has panicked mid-task must not limp along claiming task
/// load it can no longer service.
fn install_panic_guard() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        eprintln!("anqueue-worker: fatal panic, exiting");
        std::process::exit(1);
    }));
}
