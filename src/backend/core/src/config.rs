//! Configuration management.
//!
//! All configuration is read from environment variables once, at process
//! startup (`Config::from_env`), matching spec.md §6's external-interfaces
//! table. There is no file-based configuration layer in this crate.
//!
//! `MAX_TASK_RETRIES` and `TASK_TIMEOUT_MS` are deliberately *not* fields
//! here: spec.md §3 documents them as per-task, env-overridable defaults
//! (`Task::new` reads them directly, once per construction), so duplicating
//! them in `Config` would give two disconnected sources of truth for the
//! same two environment variables. `Config` owns the controller-level knobs
//! instead: the task directory, worker concurrency, and persistence.

use serde::Deserialize;

/// Main queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory scanned for executor modules and, when `database` is unset,
    /// nothing else — the directory is the queue's only required input.
    #[serde(default = "default_task_directory")]
    pub task_directory: String,

    /// Maximum number of worker processes the manager will keep alive
    /// (spec.md §6's documented default: `3`).
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    /// Maximum number of tasks a single worker will run concurrently.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Optional Postgres connection string. When absent the queue runs with
    /// `InMemoryAdapter` and no persistence.
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_directory: default_task_directory(),
            max_workers: default_max_workers(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            database_url: None,
        }
    }
}

fn default_task_directory() -> String {
    "./tasks".to_string()
}
fn default_max_workers() -> u32 {
    3
}
fn default_max_concurrent_tasks() -> usize {
    4
}

impl Config {
    /// Load configuration from the environment variables named in spec.md §6:
    /// `WORKER_ID`, `TASK_DIRECTORY`, `MAX_CONCURRENT_TASKS`, plus
    /// `ANQUEUE_GENERATE_TYPES` (logged, not used). `MAX_TASK_RETRIES` and
    /// `TASK_TIMEOUT_MS` are read directly by `Task::new`, not here.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("TASK_DIRECTORY") {
            config.task_directory = dir;
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = v.parse()?;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        if std::env::var("ANQUEUE_GENERATE_TYPES").is_ok() {
            tracing::info!(
                "ANQUEUE_GENERATE_TYPES is set but type codegen is a collaborator outside \
                 this crate's scope; no action taken"
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert!(config.database_url.is_none());
    }
}
