//! Scheduler ordering and the `single`/`batch` dispatch strategies.
//!
//! Grounded on `jobs/scheduler.rs`'s priority-first ordering idiom (it
//! schedules cron/interval jobs rather than tasks, but the sort-then-iterate
//! shape carries over unchanged) and `orchestrator/mod.rs`'s dispatch
//! accounting style (aggregate counters returned from one pass).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;

use crate::executor::ExecutorRegistry;
use crate::ipc::ParentMessage;
use crate::manager::WorkerManager;
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};

/// Aggregate counters returned by one dispatch cycle (spec.md §4.3). Their sum
/// equals the number of tasks considered (spec.md §8, property 7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub tasks_sent: u32,
    pub no_worker_available: u32,
    pub no_executor_found: u32,
    pub validation_failed: u32,
}

impl DispatchCounters {
    pub fn total(&self) -> u32 {
        self.tasks_sent + self.no_worker_available + self.no_executor_found + self.validation_failed
    }

    fn merge(&mut self, other: DispatchCounters) {
        self.tasks_sent += other.tasks_sent;
        self.no_worker_available += other.no_worker_available;
        self.no_executor_found += other.no_executor_found;
        self.validation_failed += other.validation_failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Single,
    Batch,
}

/// `batch` once ready tasks exceed a third of total worker capacity;
/// `single` otherwise (spec.md §4.3).
pub fn select_strategy(total_slots: u32, ready_count: usize) -> Strategy {
    if ready_count as u32 > total_slots / 3 {
        Strategy::Batch
    } else {
        Strategy::Single
    }
}

/// Stable sort of the pending stack by `priority` descending; equal
/// priorities keep insertion order (spec.md §3, testable property 6).
pub fn sort_by_priority(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
}

enum ValidationFailureOutcome {
    Retried,
    Exhausted,
}

/// Apply spec.md §4.1's retry rule to a validation failure: retry iff
/// `retryCount < maxRetries`, otherwise finalize as `failed`. Every call
/// records an error, whether or not it retries.
fn handle_validation_failure(task: &mut Task, reason: String) -> ValidationFailureOutcome {
    task.record_error(reason);
    if task.retry_count < task.max_retries {
        task.retry_count += 1;
        ValidationFailureOutcome::Retried
    } else {
        task.status = TaskStatus::Failed;
        task.failed_at = Some(Utc::now());
        ValidationFailureOutcome::Exhausted
    }
}

/// Sort, pick a strategy from current worker capacity, and run one dispatch
/// cycle. `tasks` is mutated in place: dispatched and exhausted tasks are
/// removed, the rest (including those still awaiting `runAt`) remain.
pub async fn run_cycle(
    tasks: &mut Vec<Task>,
    registry: &ExecutorRegistry,
    manager: &Arc<WorkerManager>,
    store: &TaskStore,
) -> DispatchCounters {
    sort_by_priority(tasks);

    let ready_count = tasks.iter().filter(|t| t.ready_to_run()).count();
    let total_slots = manager.total_slots();

    match select_strategy(total_slots, ready_count) {
        Strategy::Single => dispatch_single(tasks, registry, manager, store).await,
        Strategy::Batch => dispatch_batch(tasks, registry, manager, store).await,
    }
}

/// For each ready task: find an executor, validate, then find a worker (one
/// at a time, possibly spawning) and send `taskSingle` (spec.md §4.3).
pub async fn dispatch_single(
    tasks: &mut Vec<Task>,
    registry: &ExecutorRegistry,
    manager: &Arc<WorkerManager>,
    store: &TaskStore,
) -> DispatchCounters {
    let mut counters = DispatchCounters::default();
    let mut remaining = Vec::new();

    for mut task in std::mem::take(tasks) {
        if !task.ready_to_run() {
            remaining.push(task);
            continue;
        }

        let Some(executor) = registry.get(&task.task_type) else {
            counters.no_executor_found += 1;
            tracing::warn!(uid = %task.uid, task_type = %task.task_type, "no executor found; dropping task");
            continue;
        };

        let outcome = task.validate(executor.validation_schema());
        if !outcome.passed {
            match handle_validation_failure(&mut task, outcome.reason.unwrap_or_default()) {
                ValidationFailureOutcome::Retried => {
                    counters.validation_failed += 1;
                    remaining.push(task);
                }
                ValidationFailureOutcome::Exhausted => {
                    store.save_task(&task, None).await;
                }
            }
            continue;
        }

        match manager.get_available().await {
            Ok(Some(worker)) => match task.to_snapshot() {
                Ok(snapshot) if worker.send(ParentMessage::TaskSingle { task: snapshot }).is_ok() => {
                    counters.tasks_sent += 1;
                }
                _ => {
                    counters.no_worker_available += 1;
                    remaining.push(task);
                }
            },
            Ok(None) => {
                counters.no_worker_available += 1;
                remaining.push(task);
            }
            Err(err) => {
                err.log();
                counters.no_worker_available += 1;
                remaining.push(task);
            }
        }
    }

    *tasks = remaining;
    counters
}

/// For each currently-available worker in ascending load order, fill up to
/// its spare capacity from the head of the (already priority-sorted) list
/// and send one `taskBatch` message per worker (spec.md §4.3). A task that
/// isn't ready, lacks an executor, or fails validation doesn't consume a
/// worker's spare capacity — it's set aside (or retried/finalized) and the
/// worker keeps pulling from the queue until it's full or the queue is
/// empty. Never spawns a worker; batch dispatch only fills what's already
/// running.
pub async fn dispatch_batch(
    tasks: &mut Vec<Task>,
    registry: &ExecutorRegistry,
    manager: &Arc<WorkerManager>,
    store: &TaskStore,
) -> DispatchCounters {
    let mut counters = DispatchCounters::default();
    let mut remaining = Vec::new();
    let mut queue: VecDeque<Task> = std::mem::take(tasks).into();

    for worker in manager.available_workers_ascending() {
        let spare = worker.max_concurrent_tasks().saturating_sub(worker.cached_task_load().unwrap_or(0));
        if spare == 0 || queue.is_empty() {
            continue;
        }

        let mut batch_payload = Vec::new();
        let mut batch_counters = DispatchCounters::default();

        while batch_payload.len() < spare as usize {
            let Some(mut task) = queue.pop_front() else { break };

            if !task.ready_to_run() {
                remaining.push(task);
                continue;
            }

            let Some(executor) = registry.get(&task.task_type) else {
                batch_counters.no_executor_found += 1;
                continue;
            };

            let outcome = task.validate(executor.validation_schema());
            if !outcome.passed {
                match handle_validation_failure(&mut task, outcome.reason.unwrap_or_default()) {
                    ValidationFailureOutcome::Retried => {
                        batch_counters.validation_failed += 1;
                        remaining.push(task);
                    }
                    ValidationFailureOutcome::Exhausted => {
                        store.save_task(&task, None).await;
                    }
                }
                continue;
            }

            match task.to_snapshot() {
                Ok(snapshot) => batch_payload.push(snapshot),
                Err(_) => remaining.push(task),
            }
        }

        let sent = batch_payload.len() as u32;
        if sent > 0 {
            if worker.send(ParentMessage::TaskBatch { batch: batch_payload }).is_ok() {
                batch_counters.tasks_sent += sent;
            } else {
                batch_counters.no_worker_available += sent;
            }
        }

        counters.merge(batch_counters);
    }

    counters.no_worker_available += queue.len() as u32;
    remaining.extend(queue);

    *tasks = remaining;
    counters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_sort_is_stable_and_descending() {
        let mut tasks = vec![
            Task::new("a", serde_json::json!({})).with_uid("A").with_priority(0),
            Task::new("b", serde_json::json!({})).with_uid("B").with_priority(5),
            Task::new("c", serde_json::json!({})).with_uid("C").with_priority(5),
        ];
        sort_by_priority(&mut tasks);
        let order: Vec<&str> = tasks.iter().map(|t| t.uid.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn strategy_selection_crosses_over_at_a_third_of_slots() {
        assert_eq!(select_strategy(6, 2), Strategy::Single);
        assert_eq!(select_strategy(6, 3), Strategy::Single);
        assert_eq!(select_strategy(6, 4), Strategy::Batch);
    }

    #[test]
    fn validation_exhaustion_matches_retry_then_finalize_sequence() {
        let mut task = Task::new("strict", serde_json::json!({})).with_max_retries(2);

        assert!(matches!(
            handle_validation_failure(&mut task, "bad".to_string()),
            ValidationFailureOutcome::Retried
        ));
        assert_eq!(task.retry_count, 1);

        assert!(matches!(
            handle_validation_failure(&mut task, "bad".to_string()),
            ValidationFailureOutcome::Retried
        ));
        assert_eq!(task.retry_count, 2);

        assert!(matches!(
            handle_validation_failure(&mut task, "bad".to_string()),
            ValidationFailureOutcome::Exhausted
        ));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_history.len(), 3);
    }

    #[test]
    fn counters_total_matches_input_count_for_dropped_tasks() {
        let mut counters = DispatchCounters::default();
        counters.no_executor_found = 2;
        counters.validation_failed = 1;
        counters.no_worker_available = 1;
        assert_eq!(counters.total(), 4);
    }
}
