//! Telemetry: structured logging.
//!
//! This crate carries only the logging half of the teacher's telemetry stack —
//! there is no HTTP/gRPC surface here to export distributed traces or
//! Prometheus metrics against, so those layers were not carried forward (see
//! DESIGN.md).

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
