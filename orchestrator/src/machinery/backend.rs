//! Virtualization backend abstraction

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::Machine;

/// Power state reported by a hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Running,
    Poweroff,
    Paused,
    /// Crashed or otherwise broken; never an expected state
    Error,
    Unknown,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Running => "running",
            MachineState::Poweroff => "poweroff",
            MachineState::Paused => "paused",
            MachineState::Error => "error",
            MachineState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Machine {0} not found on backend")]
    MachineNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// One hypervisor. Calls may block until the action is done or return
/// as soon as it was issued; the manager polls `state` either way.
#[async_trait]
pub trait MachineryBackend: Send + Sync {
    /// Identifier machines refer to in their `backend` field
    fn name(&self) -> &str;

    /// Names of the machines this backend knows about
    async fn list_machines(&self) -> BackendResult<Vec<String>>;

    /// Restore the machine's snapshot and boot it
    async fn start(&self, machine: &Machine) -> BackendResult<()>;

    async fn stop(&self, machine: &Machine) -> BackendResult<()>;

    async fn restore(&self, machine: &Machine) -> BackendResult<()>;

    async fn state(&self, machine: &Machine) -> BackendResult<MachineState>;

    /// Collect hypervisor-side output (memory dump and the like)
    async fn acquire_output(&self, machine: &Machine) -> BackendResult<()>;

    /// Drop per-task resources held for the machine
    async fn release(&self, machine: &Machine) -> BackendResult<()>;
}
