//! Parent↔child wire protocol.
//!
//! Grounded on `orchestrator/worker_pool.rs`'s message-passing shape between
//! the pool and its workers, adapted to a real OS process boundary: messages
//! cross stdio as newline-delimited JSON (`tokio_util::codec::LinesCodec`)
//! rather than in-process channels, per spec.md §9 ("do not share references
//! across the process boundary... all payloads must be deep-copied/serialized
//! value types").

use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

/// Cached worker vitals, refreshed on a fixed interval by the parent-side
/// handle (spec.md §3's WorkerInfo).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub worker_id: String,
    pub process_id: u32,
    pub task_load: u32,
    pub max_load: u32,
    pub uptime_seconds: u64,
}

/// Messages the controller sends to a worker (spec.md §4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ParentMessage {
    GetWorkerInfo,
    /// Carries a connection string rather than a live adapter handle, since a
    /// trait object cannot cross a process boundary. Forwarded for parity
    /// with spec.md §4.6's protocol table; this runtime's `Executor` hooks
    /// (`on_complete`/`on_failure`) take no `db` argument, so the worker side
    /// only logs the binding rather than constructing its own adapter. All
    /// persistence happens once, controller-side, via `TaskStore`.
    SetDatabase { database_url: Option<String> },
    TaskSingle { task: serde_json::Value },
    TaskBatch { batch: Vec<serde_json::Value> },
}

/// Messages a worker sends back to the controller (spec.md §4.6, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ChildMessage {
    WorkerInfo { data: WorkerInfo, worker_id: String, process_id: u32 },
    TaskInfo {
        task: serde_json::Value,
        error: Option<String>,
        result: serde_json::Value,
        worker_id: String,
        process_id: u32,
    },
}

/// One line of newline-delimited JSON per message; a generous max length
/// guards against a runaway child wedging the parent's framed reader.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(16 * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_message_round_trips_through_json() {
        let msg = ParentMessage::TaskSingle { task: serde_json::json!({"uid": "t-1"}) };
        let line = serde_json::to_string(&msg).unwrap();
        let parsed: ParentMessage = serde_json::from_str(&line).unwrap();
        match parsed {
            ParentMessage::TaskSingle { task } => assert_eq!(task["uid"], "t-1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn child_message_tags_on_event_field() {
        let msg = ChildMessage::WorkerInfo {
            data: WorkerInfo { worker_id: "w-1".into(), process_id: 42, task_load: 0, max_load: 4, uptime_seconds: 10 },
            worker_id: "w-1".into(),
            process_id: 42,
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["event"], "workerInfo");
    }
}
