use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::backend::MachineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineAction {
    Start,
    Stop,
    Restore,
    AcquireOutput,
    Release,
}

impl MachineAction {
    /// State a machine is in once this action completed normally
    pub fn default_expected_state(&self) -> MachineState {
        match self {
            MachineAction::Start | MachineAction::AcquireOutput => MachineState::Running,
            MachineAction::Stop | MachineAction::Restore | MachineAction::Release => {
                MachineState::Poweroff
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineAction::Start => "start",
            MachineAction::Stop => "stop",
            MachineAction::Restore => "restore",
            MachineAction::AcquireOutput => "acquire_output",
            MachineAction::Release => "release",
        }
    }
}

impl fmt::Display for MachineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnexpectedState,
    Exception,
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::UnexpectedState => "unexpected_state",
            FailureReason::Exception => "exception",
            FailureReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Exactly one of these is sent for every accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReply {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl ActionReply {
    pub fn success() -> Self {
        Self {
            status: ActionStatus::Success,
            reason: None,
        }
    }

    pub fn failure(reason: FailureReason) -> Self {
        Self {
            status: ActionStatus::Failure,
            reason: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Action run when the primary one misses its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fallback {
    pub action: MachineAction,
    pub expected_state: MachineState,
    pub timeout: Duration,
}

impl Fallback {
    pub fn new(action: MachineAction, timeout: Duration) -> Self {
        Self {
            action,
            expected_state: action.default_expected_state(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub machine: String,
    pub action: MachineAction,
    pub expected_state: MachineState,
    pub timeout: Duration,
    pub fallback: Option<Fallback>,
}

impl ActionRequest {
    pub fn new(machine: impl Into<String>, action: MachineAction, timeout: Duration) -> Self {
        Self {
            machine: machine.into(),
            action,
            expected_state: action.default_expected_state(),
            timeout,
            fallback: None,
        }
    }

    pub fn expecting(mut self, state: MachineState) -> Self {
        self.expected_state = state;
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}
