//! Executor discovery, validation, and subprocess invocation.
//!
//! Grounded on `plugins/registry.rs` (`PluginRegistry::discover`'s
//! scan-and-skip-with-warning loop, idempotent re-discovery via a presence
//! check) and `plugins/manifest.rs` (load-then-`validate()`-then-admit).
//!
//! spec.md §4.2 describes discovering dynamically `require()`-d script
//! modules from a directory — a mechanism with no Rust equivalent, since Rust
//! has no runtime loading of arbitrary source files into the current process.
//! The Rust-native reading adopted here (SPEC_FULL.md §4.2) is: each executor
//! module is an **executable file**, invoked as a subprocess, the same way
//! `cargo` discovers `cargo-*` subcommands on `PATH` — keyed here by filename
//! stem in a directory instead.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::process::Command;

use crate::error::{ErrorCode, QueueError, Result};
use crate::task::{Executor, Task, ValidationRule};

const SCHEMA_FLAG: &str = "--anqueue-schema";
const SCHEMA_TIMEOUT: Duration = Duration::from_secs(2);

// ═══════════════════════════════════════════════════════════════════════════════
// Validation rule vocabulary
// ═══════════════════════════════════════════════════════════════════════════════

/// The fixed, compile-time vocabulary of named predicates an executor's
/// `--anqueue-schema` output may request by name. An unrecognized name is
/// dropped during sanitization, the Rust-native analogue of spec.md §4.2's
/// "not callable" removal — resolved rules are always `Fn(&Task) -> bool` by
/// construction, so the "not strictly boolean" failure mode does not apply.
fn vocabulary() -> HashMap<&'static str, Arc<dyn Fn(&Task) -> bool + Send + Sync>> {
    let mut rules: HashMap<&'static str, Arc<dyn Fn(&Task) -> bool + Send + Sync>> = HashMap::new();
    rules.insert("has_data", Arc::new(|t: &Task| !t.data.is_null()));
    rules.insert("has_user_id", Arc::new(|t: &Task| t.user_id.is_some()));
    rules.insert("non_negative_priority", Arc::new(|t: &Task| t.priority >= 0));
    rules.insert("name_present", Arc::new(|t: &Task| !t.name.is_empty()));
    rules.insert("within_timeout_budget", Arc::new(|t: &Task| t.timeout_ms > 0 && t.timeout_ms <= 300_000));
    rules
}

/// Resolve rule names against the vocabulary, returning the resolved rules
/// plus the names that did not resolve (for the removal log spec.md §4.2
/// calls for).
fn resolve_validation_rules(names: &[String]) -> (Vec<ValidationRule>, Vec<String>) {
    let vocab = vocabulary();
    let mut resolved = Vec::new();
    let mut dropped = Vec::new();

    for name in names {
        match vocab.get(name.as_str()) {
            Some(predicate) => resolved.push(ValidationRule { name: name.clone(), predicate: predicate.clone() }),
            None => dropped.push(name.clone()),
        }
    }

    (resolved, dropped)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schema introspection payload
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct ExecutorSchema {
    #[serde(default)]
    retry_patterns: Vec<String>,
    #[serde(default)]
    rules: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Discovered executor
// ═══════════════════════════════════════════════════════════════════════════════

/// An executor backed by an executable file. `exec` invokes it as a child
/// process: the task's JSON snapshot on stdin, the result JSON on stdout, exit
/// code 0 for success, nonzero for an executor exception (message = captured
/// stderr).
pub struct DiscoveredExecutor {
    task_type: String,
    path: PathBuf,
    retry_patterns: Vec<String>,
    raw_rule_names: Vec<String>,
    validation_rules: Vec<ValidationRule>,
}

impl DiscoveredExecutor {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The rule names exactly as reported by the executable, before
    /// sanitization — preserved per spec.md §4.2 ("preserve the raw list via
    /// a separate accessor").
    pub fn raw_validation_rule_names(&self) -> &[String] {
        &self.raw_rule_names
    }
}

#[async_trait]
impl Executor for DiscoveredExecutor {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn validation_schema(&self) -> &[ValidationRule] {
        &self.validation_rules
    }

    fn retry_schema(&self) -> &[String] {
        &self.retry_patterns
    }

    async fn exec(&self, task: &Task) -> Result<serde_json::Value> {
        let payload = task.to_snapshot()?;
        let mut child = Command::new(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                QueueError::with_internal(
                    ErrorCode::ExecutorExecutionFailed,
                    "failed to launch executor",
                    e.to_string(),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(&payload)?;
            stdin.write_all(&bytes).await?;
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let truncated: String = stderr.chars().take(2000).collect();
            return Err(QueueError::with_internal(
                ErrorCode::ExecutorExecutionFailed,
                format!("executor '{}' exited with {}", self.task_type, output.status),
                truncated,
            ));
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        Ok(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Discovers, validates, and indexes per-type executors from a task
/// directory. One instance lives in the controller; each worker runtime holds
/// its own, built `quiet` to keep worker stdout free of registration chatter
/// (spec.md §4.2's "warn... on the controller only").
pub struct ExecutorRegistry {
    task_directory: PathBuf,
    executors: DashMap<String, Arc<DiscoveredExecutor>>,
    initialized: AtomicBool,
    quiet: bool,
}

impl ExecutorRegistry {
    pub fn new(task_directory: impl Into<PathBuf>, quiet: bool) -> Self {
        Self {
            task_directory: task_directory.into(),
            executors: DashMap::new(),
            initialized: AtomicBool::new(false),
            quiet,
        }
    }

    /// Scan the task directory and populate the registry. A no-op on any call
    /// after the first (spec.md §4.2 idempotency).
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.discover().await
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<DiscoveredExecutor>> {
        self.executors.get(task_type).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Every registered `type`, for `TaskStore::sync_with_db`'s recovery
    /// filter (spec.md §4.4: only rows whose type is registered are
    /// reconstructed).
    pub fn registered_types(&self) -> Vec<String> {
        self.executors.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn discover(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.task_directory).await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::ExecutorDiscoveryFailed,
                "could not read task directory",
                e.to_string(),
            )
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(QueueError::from)? {
            let path = entry.path();
            if !is_candidate_executor_file(&path) {
                continue;
            }

            if !is_executable(&path).await {
                continue;
            }

            let task_type = match path.file_stem().and_then(OsStr::to_str) {
                Some(stem) => stem.to_string(),
                None => continue,
            };

            if self.executors.contains_key(&task_type) {
                continue;
            }

            match self.load_one(&path, &task_type).await {
                Ok(executor) => {
                    self.executors.insert(task_type.clone(), Arc::new(executor));
                    if !self.quiet {
                        tracing::info!(task_type = %task_type, path = %path.display(), "registered executor");
                    }
                }
                Err(err) => {
                    if !self.quiet {
                        tracing::warn!(path = %path.display(), error = %err, "skipping invalid executor");
                    }
                }
            }
        }

        Ok(())
    }

    async fn load_one(&self, path: &Path, task_type: &str) -> Result<DiscoveredExecutor> {
        let schema = introspect_schema(path).await?;
        let (validation_rules, dropped) = resolve_validation_rules(&schema.rules);

        if !self.quiet && !dropped.is_empty() {
            tracing::warn!(task_type = %task_type, dropped = ?dropped, "dropped unrecognized validation rule names");
        }
        if !self.quiet && !schema.rules.is_empty() && validation_rules.is_empty() {
            tracing::warn!(task_type = %task_type, "validation schema is empty after sanitization");
        }

        Ok(DiscoveredExecutor {
            task_type: task_type.to_string(),
            path: path.to_path_buf(),
            retry_patterns: schema.retry_patterns,
            raw_rule_names: schema.rules,
            validation_rules,
        })
    }
}

fn is_candidate_executor_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    if name.contains(".test.") || name.contains(".copy") {
        return false;
    }
    true
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

async fn introspect_schema(path: &Path) -> Result<ExecutorSchema> {
    let spawn = Command::new(path)
        .arg(SCHEMA_FLAG)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = spawn.map_err(|e| {
        QueueError::with_internal(ErrorCode::ExecutorDiscoveryFailed, "failed to launch executor for introspection", e.to_string())
    })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let wait = async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, buf))
    };

    let (status, buf) = tokio::time::timeout(SCHEMA_TIMEOUT, wait)
        .await
        .map_err(|_| QueueError::new(ErrorCode::ExecutorTimeout, "executor schema introspection timed out"))?
        .map_err(QueueError::from)?;

    if !status.success() {
        return Err(QueueError::new(ErrorCode::ExecutorDiscoveryFailed, "executor schema introspection exited non-zero"));
    }

    serde_json::from_slice(&buf).map_err(QueueError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

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

    #[test]
    fn candidate_filter_excludes_hidden_and_test_and_copy_files() {
        assert!(is_candidate_executor_file(Path::new("/tasks/noop")));
        assert!(!is_candidate_executor_file(Path::new("/tasks/.hidden")));
        assert!(!is_candidate_executor_file(Path::new("/tasks/noop.test.sh")));
        assert!(!is_candidate_executor_file(Path::new("/tasks/noop.copy.sh")));
    }

    #[test]
    fn unknown_rule_names_are_dropped_and_reported() {
        let (resolved, dropped) = resolve_validation_rules(&[
            "has_data".to_string(),
            "does_not_exist".to_string(),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "has_data");
        assert_eq!(dropped, vec!["does_not_exist".to_string()]);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn discovers_and_executes_a_shell_executor() {
        let dir = tempfile::tempdir().unwrap();
        write_executable_script(
            dir.path(),
            "noop",
            "#!/bin/sh\nif [ \"$1\" = \"--anqueue-schema\" ]; then echo '{\"retry_patterns\":[],\"rules\":[\"has_data\"]}'; else cat > /dev/null; echo '{\"processed\":true}'; fi\n",
        );

        let registry = ExecutorRegistry::new(dir.path(), true);
        registry.initialize().await.unwrap();
        assert_eq!(registry.len(), 1);

        let executor = registry.get("noop").unwrap();
        assert_eq!(executor.validation_schema().len(), 1);

        let task = Task::new("noop", serde_json::json!({ "x": 1 }));
        let result = executor.exec(&task).await.unwrap();
        assert_eq!(result["processed"], true);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ExecutorRegistry::new(dir.path(), true);
        registry.initialize().await.unwrap();
        registry.initialize().await.unwrap();
        assert_eq!(registry.len(), 0);
    }
}
