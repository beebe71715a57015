//! Error handling for anqueue-core.
//!
//! This module provides:
//! - A machine-readable [`ErrorCode`] enum and [`ErrorSeverity`] classification
//! - A single [`QueueError`] type with user-facing vs internal messages
//! - Retryability classification, used by the retry engine in [`crate::task`]
//! - `From` conversions for the error types this crate's adapters and
//!   subprocess-based executors actually produce

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Task lifecycle (1000-1099)
    TaskNotFound,
    TaskAlreadyExists,
    InvalidStateTransition,

    // Executor errors (1100-1199)
    ExecutorNotFound,
    ExecutorDiscoveryFailed,
    ExecutorExecutionFailed,
    ExecutorTimeout,

    // Worker errors (1200-1299)
    WorkerSpawnFailed,
    WorkerCrashed,
    WorkerUnresponsive,

    // Validation (1300-1399)
    ValidationFailed,

    // Adapter / persistence (2000-2099)
    AdapterError,
    RecordNotFound,
    DuplicateRecord,

    // Serialization (2200-2299)
    SerializationError,

    // Timeouts (2300-2399)
    Timeout,

    // Configuration (5000-5099)
    ConfigurationError,

    // Internal (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Numeric code, stable for external consumers.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TaskNotFound => 1000,
            Self::TaskAlreadyExists => 1001,
            Self::InvalidStateTransition => 1002,

            Self::ExecutorNotFound => 1100,
            Self::ExecutorDiscoveryFailed => 1101,
            Self::ExecutorExecutionFailed => 1102,
            Self::ExecutorTimeout => 1103,

            Self::WorkerSpawnFailed => 1200,
            Self::WorkerCrashed => 1201,
            Self::WorkerUnresponsive => 1202,

            Self::ValidationFailed => 1300,

            Self::AdapterError => 2000,
            Self::RecordNotFound => 2001,
            Self::DuplicateRecord => 2002,

            Self::SerializationError => 2200,

            Self::Timeout => 2300,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Whether operations that fail with this code are generally safe to retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ExecutorTimeout
                | Self::WorkerUnresponsive
                | Self::WorkerCrashed
                | Self::Timeout
                | Self::AdapterError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging verbosity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller/input errors.
    Low,
    /// Operational issues (timeouts, a crashed worker that will be restarted).
    Medium,
    /// System errors (adapter failures, serialization bugs).
    High,
    /// Requires immediate attention.
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::TaskNotFound
            | ErrorCode::TaskAlreadyExists
            | ErrorCode::ValidationFailed
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition
            | ErrorCode::ExecutorNotFound => Self::Low,

            ErrorCode::ExecutorTimeout
            | ErrorCode::Timeout
            | ErrorCode::WorkerCrashed
            | ErrorCode::WorkerUnresponsive => Self::Medium,

            ErrorCode::ExecutorDiscoveryFailed
            | ErrorCode::ExecutorExecutionFailed
            | ErrorCode::AdapterError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::WorkerSpawnFailed => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for anqueue-core.
#[derive(Error, Debug)]
pub struct QueueError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        }
    }

    /// Create an error with both a user-facing and an internal message.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            user_message: user_message.into(),
            internal_message: Some(internal_message.into()),
            source: None,
        }
    }

    /// Construct an [`ErrorCode::InternalError`] from a bare message.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::InternalError, "internal error", message)
    }

    pub fn task_not_found(task_id: impl fmt::Display) -> Self {
        Self::with_internal(
            ErrorCode::TaskNotFound,
            "task not found",
            format!("no task with id {task_id}"),
        )
    }

    pub fn executor_not_found(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        Self::with_internal(
            ErrorCode::ExecutorNotFound,
            "no executor registered for task type",
            format!("unregistered task type: {task_type}"),
        )
    }

    pub fn invalid_state_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::with_internal(
            ErrorCode::InvalidStateTransition,
            "invalid task state transition",
            format!("cannot transition {from} -> {to}"),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::ValidationFailed, message.clone(), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::Timeout, message.clone(), message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_internal(ErrorCode::ConfigurationError, message.clone(), message)
    }

    /// Attach a source error (for error chaining / `anyhow` interop).
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Emit this error via `tracing`, at a level matched to its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Low => tracing::debug!(code = %self.code, "{}", self),
            ErrorSeverity::Medium => tracing::warn!(code = %self.code, "{}", self),
            ErrorSeverity::High | ErrorSeverity::Critical => {
                tracing::error!(code = %self.code, "{}", self)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("23505") {
                return QueueError::with_internal(
                    ErrorCode::DuplicateRecord,
                    "unique constraint violated",
                    db_err.message().to_string(),
                );
            }
        }
        QueueError::with_internal(ErrorCode::AdapterError, "persistence operation failed", err.to_string())
            .with_source(err)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::with_internal(ErrorCode::SerializationError, "malformed json", err.to_string())
            .with_source(err)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::with_internal(ErrorCode::ExecutorExecutionFailed, "io error", err.to_string())
            .with_source(err)
    }
}

impl From<tokio::time::error::Elapsed> for QueueError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        QueueError::new(ErrorCode::Timeout, "operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes_match_expected_set() {
        assert!(ErrorCode::ExecutorTimeout.is_retryable());
        assert!(ErrorCode::WorkerCrashed.is_retryable());
        assert!(!ErrorCode::ValidationFailed.is_retryable());
        assert!(!ErrorCode::TaskNotFound.is_retryable());
    }

    #[test]
    fn severity_buckets() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::TaskNotFound), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::InternalError), ErrorSeverity::Critical);
    }

    #[test]
    fn display_includes_internal_message() {
        let err = QueueError::with_internal(ErrorCode::AdapterError, "store unavailable", "pool exhausted");
        let rendered = err.to_string();
        assert!(rendered.contains("store unavailable"));
        assert!(rendered.contains("pool exhausted"));
    }

    #[test]
    fn unique_violation_maps_to_duplicate_record() {
        // sqlx::Error::Database requires a boxed DatabaseError trait object which
        // is awkward to construct directly in a unit test; the behavior is instead
        // exercised end-to-end in adapter.rs's PgAdapter tests against a real pool.
    }
}
