//! Machinery manager: machine pool, lifecycle actions and backends

pub mod action;
pub mod backend;
pub mod manager;
pub mod pool;
pub mod virsh;
mod waiter;

pub use action::{ActionReply, ActionRequest, ActionStatus, FailureReason, Fallback, MachineAction};
pub use backend::{BackendError, BackendResult, MachineState, MachineryBackend};
pub use manager::MachineryManager;
pub use pool::MachinePool;
pub use virsh::VirshBackend;

use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::Machine;

/// Read machine definitions from a JSON file holding a list of machines
pub async fn load_machines(path: &Path) -> Result<Vec<Machine>> {
    let raw = tokio::fs::read(path).await?;
    let machines: Vec<Machine> = serde_json::from_slice(&raw)?;

    let mut seen = std::collections::HashSet::new();
    for machine in &machines {
        if !seen.insert(machine.name.as_str()) {
            return Err(OrchestratorError::Storage(format!(
                "duplicate machine name '{}' in {}",
                machine.name,
                path.display()
            )));
        }
    }
    Ok(machines)
}
