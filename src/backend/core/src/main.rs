//! `anqueue-server` — the controller process entry point.
//!
//! Grounded on the teacher's `main.rs` startup sequence (dotenv → config →
//! observability → run), trimmed to this crate's surface: there is no HTTP
//! server here, just `Queue::init` followed by `Queue::run_automatically`.

use std::sync::Arc;

use anqueue_core::adapter::PgAdapter;
use anqueue_core::config::Config;
use anqueue_core::queue::{Queue, QueueOptions};
use anqueue_core::telemetry::{init_logging, LoggingConfig};
use clap::Parser;

/// In-process task queue controller.
#[derive(Parser, Debug)]
#[command(name = "anqueue-server", version, about)]
struct Cli {
    /// Directory scanned for executor modules.
    #[arg(long, env = "TASK_DIRECTORY")]
    task_directory: Option<String>,

    /// Identifier for this queue instance.
    #[arg(long, env = "ANQUEUE_ID")]
    id: Option<String>,

    /// Maximum number of worker processes.
    #[arg(long, env = "ANQUEUE_MAX_WORKERS")]
    max_workers: Option<u32>,

    /// Seconds to sleep between dispatch cycles in `run_automatically`.
    #[arg(long, default_value_t = 5)]
    cycle_seconds: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_logging(&LoggingConfig::default())?;

    let cli = Cli::parse();
    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not load configuration from environment; using defaults");
        Config::default()
    });

    let task_directory = cli.task_directory.unwrap_or(config.task_directory);

    tracing::info!(task_directory = %task_directory, "starting anqueue-server");

    let queue = Queue::new(
        task_directory,
        QueueOptions {
            id: cli.id,
            worker_prefix: None,
            max_workers: Some(cli.max_workers.unwrap_or(config.max_workers)),
            max_concurrent_tasks: config.max_concurrent_tasks as u32,
            cache_interval: std::time::Duration::from_millis(200),
        },
    )?;

    if let Some(database_url) = config.database_url {
        match PgAdapter::connect(&database_url).await {
            Ok(adapter) => {
                queue.set_database(Arc::new(adapter));
                tracing::info!("connected to persistence adapter");
            }
            Err(err) => {
                err.log();
                tracing::warn!("continuing without persistence; the queue runs in-memory only");
            }
        }
    }

    queue.init().await?;
    tracing::info!(id = queue.id(), "queue initialized");

    tokio::select! {
        _ = queue.run_automatically(cli.cycle_seconds) => {}
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
