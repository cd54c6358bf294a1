//! Error taxonomy for the orchestration core

use shared::messaging::IpcError;
use shared::types::{ParseStageError, Stage};
use thiserror::Error;

use crate::machinery::FailureReason;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed or unknown IPC message. The frame is dropped, the
    /// connection and the controller keep going.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Setup failed for {target}: {reason}")]
    SetupFailed { target: String, reason: String },

    #[error("Work failed for {analysis_id}: {reason}")]
    WorkFailed { analysis_id: String, reason: String },

    #[error("Action {action} on machine {machine} failed: {reason}")]
    MachineActionFailed {
        machine: String,
        action: String,
        reason: FailureReason,
    },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown machine: {0}")]
    UnknownMachine(String),

    #[error("Machine {0} already has an action in flight")]
    MachineBusy(String),

    #[error("Machine {0} is disabled")]
    MachineDisabled(String),

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} is no longer running")]
    ChannelClosed(&'static str),
}

impl OrchestratorError {
    pub fn unknown_stage(stage: Stage) -> Self {
        OrchestratorError::UnknownStage(stage.to_string())
    }
}

impl From<ParseStageError> for OrchestratorError {
    fn from(err: ParseStageError) -> Self {
        OrchestratorError::UnknownStage(err.0)
    }
}

impl From<IpcError> for OrchestratorError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Io(e) => OrchestratorError::Io(e),
            other => OrchestratorError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
