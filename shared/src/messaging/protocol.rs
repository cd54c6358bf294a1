//! Worker protocol
//!
//! Worker -> handler: `READY`, `FINISHED`, `WORK_FAIL`, `SETUP_FAIL`.
//! Handler -> worker: `WORK`, carrying a single work item.
//!
//! Every frame is `{"subject": ..., "payload": {...}}`; an unknown subject
//! is a decode error at the transport boundary.

use serde::{Deserialize, Serialize};

use crate::types::WorkItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Setup complete, or back to idle after a work item
    Ready,
    /// Work item done; carries the stage result
    Finished { result: serde_json::Value },
    /// Work item failed; the worker itself stays usable
    WorkFail { error: String },
    /// Plugin loading failed; the worker will not accept work
    SetupFail { error: String },
}

impl WorkerMessage {
    pub fn subject(&self) -> &'static str {
        match self {
            WorkerMessage::Ready => "READY",
            WorkerMessage::Finished { .. } => "FINISHED",
            WorkerMessage::WorkFail { .. } => "WORK_FAIL",
            WorkerMessage::SetupFail { .. } => "SETUP_FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandlerMessage {
    Work(WorkItem),
}
