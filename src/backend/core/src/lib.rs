#![allow(clippy::result_large_err)]
//! # anqueue-core
//!
//! An in-process task queue with a supervising controller and a pool of
//! worker processes.
//!
//! - **`task`** — the `Task` value type, state machine, and retry engine.
//! - **`executor`** — discovers, validates, and indexes per-type executors
//!   from a task directory.
//! - **`adapter`** — the persistence adapter contract plus an in-memory and a
//!   Postgres implementation.
//! - **`store`** — optional-adapter task persistence: recovery sync and
//!   save-on-reply.
//! - **`dispatch`** — priority scheduling and the `single`/`batch` dispatch
//!   strategies.
//! - **`worker`** / **`manager`** — the parent-side handle onto a worker
//!   child process, and the set of all of them.
//! - **`runtime`** — the child-side concurrency gate and message loop.
//! - **`ipc`** — the wire protocol between controller and worker.
//! - **`queue`** — the public facade (`Queue`) wiring the above together.
//! - **`glue`** — task-directory fingerprinting.
//! - **`config`** / **`error`** / **`telemetry`** — ambient concerns.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod glue;
pub mod ipc;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worker;

pub use error::{ErrorCode, ErrorSeverity, QueueError, Result};

/// Re-export of the commonly used surface.
pub mod prelude {
    pub use crate::adapter::{Adapter, InMemoryAdapter, PersistedTaskRow};
    pub use crate::config::Config;
    pub use crate::dispatch::{DispatchCounters, Strategy};
    pub use crate::error::{ErrorCode, ErrorSeverity, QueueError, Result};
    pub use crate::executor::ExecutorRegistry;
    pub use crate::ipc::WorkerInfo;
    pub use crate::manager::{WorkerManager, WorkerManagerOptions};
    pub use crate::queue::{Queue, QueueOptions};
    pub use crate::store::TaskStore;
    pub use crate::task::{Executor, Task, TaskStatus, ValidationRule};
}
