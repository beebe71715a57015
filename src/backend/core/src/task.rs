//! Task value type, state machine, and retry engine.
//!
//! Grounded on `jobs/job.rs`'s `JobMetadata`/`RetryPolicy` pair, collapsed into
//! a single stateful value type per spec.md §4.1: this crate's `Task` owns its
//! own execution (`Task::execute`), whereas the teacher's `Job` trait is
//! implemented by user code and driven by an external `JobWorker`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::Adapter;
use crate::error::{ErrorCode, QueueError, Result};

/// A substring that is always eligible for retry, in addition to whatever an
/// executor's own `retry_schema()` contributes. Mirrors spec.md §4.1's builtin
/// `"Network timeout"` pattern.
pub const BUILTIN_RETRY_PATTERN: &str = "Network timeout";

fn default_max_retries() -> u32 {
    std::env::var("MAX_TASK_RETRIES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
}

fn default_timeout_ms() -> u64 {
    std::env::var("TASK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30_000)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error history
// ═══════════════════════════════════════════════════════════════════════════════

/// One entry of a task's `errorHistory`: structured per SPEC_FULL.md's
/// `original_source`-derived supplement, not a bare string, so operators can
/// see when an attempt failed, not only what failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHistoryEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: Option<String>,
    /// Higher runs earlier. Unlike `JobPriority`, this is a plain integer — the
    /// scheduler only needs a total order, and callers may pass arbitrary
    /// values (SPEC_FULL.md §3).
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub timeout_ms: u64,
    pub run_at: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
    pub user_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_history: Vec<ErrorHistoryEntry>,
    pub status: TaskStatus,
}

impl Task {
    /// Create a new pending task of the given type with auto-generated `uid`.
    pub fn new(task_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            uid: Uuid::new_v4().to_string(),
            name: String::new(),
            task_type: task_type.into(),
            description: None,
            priority: 0,
            retry_count: 0,
            max_retries: default_max_retries(),
            delay_ms: 0,
            timeout_ms: default_timeout_ms(),
            run_at: None,
            data,
            user_id: None,
            metadata: HashMap::new(),
            progress: 0,
            started_at: None,
            failed_at: None,
            completed_at: None,
            error: None,
            error_history: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// `true` iff `run_at` is unset or has already passed.
    pub fn ready_to_run(&self) -> bool {
        match self.run_at {
            Some(t) => t <= Utc::now(),
            None => true,
        }
    }

    /// Clamp and set `progress`.
    pub fn update_progress(&mut self, progress: i64) {
        self.progress = progress.clamp(0, 100) as u8;
    }

    /// Transition `pending`/`running` → `cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => {
                self.status = TaskStatus::Cancelled;
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            other => Err(QueueError::invalid_state_transition(other, TaskStatus::Cancelled)),
        }
    }

    /// Push a timestamped entry onto `error_history` and set `error`. Retries
    /// never clear `error_history` (spec.md §4.1 invariant).
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error = Some(message.clone());
        self.error_history.push(ErrorHistoryEntry { at: Utc::now(), message });
    }

    /// Run every predicate against this task in order; the first failure
    /// short-circuits with a reason identifying which predicate failed.
    pub fn validate(&self, rules: &[ValidationRule]) -> ValidationOutcome {
        for (index, rule) in rules.iter().enumerate() {
            if !(rule.predicate)(self) {
                return ValidationOutcome {
                    passed: false,
                    reason: Some(format!("validation rule[{index}] '{}' failed", rule.name)),
                };
            }
        }
        ValidationOutcome { passed: true, reason: None }
    }

    /// `Task` round-trips through its serialized snapshot for the
    /// controller↔worker wire boundary (SPEC_FULL.md §4.1); never share a
    /// `Task` by reference across a process boundary.
    pub fn to_snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_snapshot(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Run this task to completion against `executor`, including the retry
    /// loop described in spec.md §4.1. Returns the final executor result
    /// object on both `completed` and (non-retried) `failed` outcomes; returns
    /// `Err` only for the programmer error of calling `execute` on a task that
    /// is not `pending`.
    pub async fn execute(&mut self, executor: &dyn Executor) -> Result<serde_json::Value> {
        loop {
            if self.status != TaskStatus::Pending {
                return Err(QueueError::invalid_state_transition(self.status, TaskStatus::Running));
            }

            self.status = TaskStatus::Running;
            self.started_at = Some(Utc::now());
            self.progress = 0;

            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }

            let timeout_dur = Duration::from_millis(self.timeout_ms);
            let settled = match tokio::time::timeout(timeout_dur, executor.exec(self)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("Task {} timed out after {}ms", self.uid, self.timeout_ms)),
            };

            match settled {
                Ok(result) => {
                    let processed = result.get("processed").and_then(|v| v.as_bool()).unwrap_or(false);
                    if processed {
                        self.status = TaskStatus::Completed;
                        self.completed_at = Some(Utc::now());
                        self.progress = 100;
                    } else {
                        self.status = TaskStatus::Failed;
                        self.failed_at = Some(Utc::now());
                        self.progress = 0;
                    }
                    return Ok(result);
                }
                Err(message) => {
                    self.record_error(message.clone());

                    let retryable = self.retry_count < self.max_retries
                        && std::iter::once(BUILTIN_RETRY_PATTERN)
                            .chain(executor.retry_schema().iter().map(String::as_str))
                            .any(|pattern| message.contains(pattern));

                    if retryable {
                        self.retry_count += 1;
                        self.status = TaskStatus::Pending;
                        self.progress = 0;
                        self.started_at = None;
                        self.completed_at = None;
                        self.error = None;
                        continue;
                    }

                    self.status = TaskStatus::Failed;
                    self.failed_at = Some(Utc::now());
                    self.progress = 0;
                    return Err(QueueError::new(ErrorCode::ExecutorExecutionFailed, message));
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════════════

/// A named predicate over a `Task`, resolved from the fixed vocabulary in
/// `executor.rs`. Every `ValidationRule` is `Fn(&Task) -> bool` by
/// construction, so unlike the original system's dynamically loaded
/// predicates, a resolved rule can never be "not callable" or return a
/// non-boolean — only an unrecognized *name* can fail to resolve, which
/// `executor.rs`'s sanitization step handles before a `ValidationRule` exists.
#[derive(Clone)]
pub struct ValidationRule {
    pub name: String,
    pub predicate: Arc<dyn Fn(&Task) -> bool + Send + Sync>,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-task-type pluggable behavior, keyed by `type` (spec.md §3's Executor).
/// `executor.rs`'s `ExecutorRegistry` discovers implementations of this trait
/// from subprocesses in a task directory; `DiscoveredExecutor` is the sole
/// implementation shipped in this crate.
#[async_trait]
pub trait Executor: Send + Sync {
    fn task_type(&self) -> &str;

    /// Sanitized validation predicates — never the raw, as-discovered list.
    fn validation_schema(&self) -> &[ValidationRule];

    /// Substring patterns checked against error messages during retry
    /// decisions, in addition to `BUILTIN_RETRY_PATTERN`.
    fn retry_schema(&self) -> &[String];

    /// Execute one task, returning the raw result object. A `processed: true`
    /// field marks success; `processed: false` marks a non-retryable failure.
    async fn exec(&self, task: &Task) -> Result<serde_json::Value>;

    async fn on_complete(&self, _task: &Task, _result: &serde_json::Value) {}

    async fn on_failure(&self, _task: &Task, _error: &str) {}

    /// Optional hook run controller-side, after `TaskStore::save_task`, with
    /// the adapter the store persisted through (if any). Most executors have
    /// no use for it; the default is a no-op (spec.md §4.2's "optional
    /// hooks").
    async fn save_result(&self, _task: &Task, _adapter: Option<Arc<dyn Adapter>>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl Executor for AlwaysSucceeds {
        fn task_type(&self) -> &str {
            "noop"
        }
        fn validation_schema(&self) -> &[ValidationRule] {
            &[]
        }
        fn retry_schema(&self) -> &[String] {
            &[]
        }
        async fn exec(&self, _task: &Task) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "processed": true, "ok": 1 }))
        }
    }

    struct AlwaysRejects;

    #[async_trait]
    impl Executor for AlwaysRejects {
        fn task_type(&self) -> &str {
            "rejecting"
        }
        fn validation_schema(&self) -> &[ValidationRule] {
            &[]
        }
        fn retry_schema(&self) -> &[String] {
            &[]
        }
        async fn exec(&self, _task: &Task) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "processed": false }))
        }
    }

    struct AlwaysTimesOut {
        retry_schema: Vec<String>,
    }

    impl AlwaysTimesOut {
        fn new() -> Self {
            // Matches spec.md §8 scenario 3's `retrySchema=["timed out"]`, which
            // the `execute` timeout message ("Task {uid} timed out after
            // {timeout}ms") actually contains, unlike the builtin
            // `"Network timeout"` pattern alone.
            Self { retry_schema: vec!["timed out".to_string()] }
        }
    }

    #[async_trait]
    impl Executor for AlwaysTimesOut {
        fn task_type(&self) -> &str {
            "slow"
        }
        fn validation_schema(&self) -> &[ValidationRule] {
            &[]
        }
        fn retry_schema(&self) -> &[String] {
            &self.retry_schema
        }
        async fn exec(&self, _task: &Task) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(serde_json::json!({ "processed": true }))
        }
    }

    #[tokio::test]
    async fn happy_path_completes_and_reaches_full_progress() {
        let mut task = Task::new("noop", serde_json::json!({}));
        let result = task.execute(&AlwaysSucceeds).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());
        assert_eq!(result["ok"], 1);
    }

    #[tokio::test]
    async fn processed_false_finalizes_as_failed_without_retry() {
        let mut task = Task::new("rejecting", serde_json::json!({}));
        task.execute(&AlwaysRejects).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.progress, 0);
    }

    #[tokio::test]
    async fn timeout_retries_then_finalizes_failed_with_history() {
        let mut task = Task::new("slow", serde_json::json!({}))
            .with_timeout_ms(50)
            .with_max_retries(1);

        let outcome = task.execute(&AlwaysTimesOut::new()).await;
        assert!(outcome.is_err());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_history.len(), 2);
        assert!(task.error.as_deref().unwrap().contains("timed out after 50ms"));
    }

    #[test]
    fn progress_clamps_into_0_100() {
        let mut task = Task::new("noop", serde_json::json!({}));
        task.update_progress(-10);
        assert_eq!(task.progress, 0);
        task.update_progress(250);
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn cancel_from_pending_and_running_succeeds_from_terminal_fails() {
        let mut task = Task::new("noop", serde_json::json!({}));
        assert!(task.cancel().is_ok());
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.cancel().is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_identity_fields() {
        let task = Task::new("noop", serde_json::json!({"x": 1}))
            .with_uid("fixed-uid")
            .with_name("demo")
            .with_priority(5);
        let snapshot = task.to_snapshot().unwrap();
        let restored = Task::from_snapshot(snapshot).unwrap();
        assert_eq!(restored.uid, "fixed-uid");
        assert_eq!(restored.name, "demo");
        assert_eq!(restored.priority, 5);
        assert_eq!(restored.data, task.data);
    }

    #[test]
    fn validate_stops_at_first_failing_rule() {
        let task = Task::new("noop", serde_json::json!({}));
        let rules = vec![
            ValidationRule { name: "always_true".into(), predicate: Arc::new(|_| true) },
            ValidationRule { name: "always_false".into(), predicate: Arc::new(|_| false) },
        ];
        let outcome = task.validate(&rules);
        assert!(!outcome.passed);
        assert!(outcome.reason.unwrap().contains("always_false"));
    }

    #[test]
    fn ready_to_run_respects_run_at() {
        let task = Task::new("noop", serde_json::json!({}));
        assert!(task.ready_to_run());
        let future_task = task.with_run_at(Utc::now() + chrono::Duration::seconds(60));
        assert!(!future_task.ready_to_run());
    }
}
