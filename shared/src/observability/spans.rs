//! Spans that tie log lines to the pipeline object they concern

use tracing::Span;

use crate::types::Stage;

/// Span covering work on one task
pub fn task_span(task_id: &str) -> Span {
    tracing::info_span!("task", task_id = %task_id)
}

/// Span covering a lifecycle action on one machine
pub fn machine_span(machine: &str, action: &str) -> Span {
    tracing::info_span!("machine_action", machine = %machine, action = %action)
}

/// Span covering a stage worker process
pub fn worker_span(stage: Stage, worker: &str) -> Span {
    tracing::info_span!("stage_worker", stage = %stage, worker = %worker)
}
