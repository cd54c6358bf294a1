/// libvirt backend driven through the `virsh` command line
///
/// Every call shells out and returns once `virsh` exits. `start` reverts
/// the machine to its snapshot first, so a task always begins from a
/// clean image.
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

use super::backend::{BackendError, BackendResult, MachineState, MachineryBackend};
use crate::models::Machine;

pub struct VirshBackend {
    binary: String,
    connect_uri: Option<String>,
    output_dir: PathBuf,
}

impl VirshBackend {
    pub fn new(connect_uri: Option<String>, output_dir: PathBuf) -> Self {
        Self {
            binary: "virsh".to_string(),
            connect_uri,
            output_dir,
        }
    }

    async fn virsh(&self, args: &[&str]) -> BackendResult<String> {
        let mut cmd = Command::new(&self.binary);
        if let Some(uri) = &self.connect_uri {
            cmd.arg("--connect").arg(uri);
        }
        cmd.args(args);

        debug!(args = ?args, "Running virsh");
        let output = cmd.output().await?;

        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command: format!("virsh {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn revert(&self, machine: &Machine) -> BackendResult<()> {
        match &machine.snapshot {
            Some(snapshot) => {
                self.virsh(&["snapshot-revert", &machine.name, snapshot])
                    .await?
            }
            None => self.virsh(&["snapshot-revert", &machine.name, "--current"]).await?,
        };
        Ok(())
    }
}

/// Map `virsh domstate` output to a machine state
pub fn parse_domstate(raw: &str) -> MachineState {
    match raw.trim() {
        "running" | "idle" => MachineState::Running,
        "shut off" | "shutoff" => MachineState::Poweroff,
        "paused" | "pmsuspended" => MachineState::Paused,
        "crashed" | "dying" => MachineState::Error,
        _ => MachineState::Unknown,
    }
}

#[async_trait]
impl MachineryBackend for VirshBackend {
    fn name(&self) -> &str {
        "virsh"
    }

    async fn list_machines(&self) -> BackendResult<Vec<String>> {
        let out = self.virsh(&["list", "--all", "--name"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn start(&self, machine: &Machine) -> BackendResult<()> {
        self.revert(machine).await?;
        // Live snapshots come back running
        if self.state(machine).await? == MachineState::Running {
            return Ok(());
        }
        self.virsh(&["start", &machine.name]).await?;
        Ok(())
    }

    async fn stop(&self, machine: &Machine) -> BackendResult<()> {
        match self.state(machine).await? {
            MachineState::Poweroff => Ok(()),
            _ => {
                self.virsh(&["destroy", &machine.name]).await?;
                Ok(())
            }
        }
    }

    async fn restore(&self, machine: &Machine) -> BackendResult<()> {
        if self.state(machine).await? != MachineState::Poweroff {
            self.virsh(&["destroy", &machine.name]).await?;
        }
        self.revert(machine).await
    }

    async fn state(&self, machine: &Machine) -> BackendResult<MachineState> {
        let out = self.virsh(&["domstate", &machine.name]).await?;
        Ok(parse_domstate(&out))
    }

    async fn acquire_output(&self, machine: &Machine) -> BackendResult<()> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let target = self.output_dir.join(format!("{}.dmp", machine.name));
        let target = target.to_string_lossy().into_owned();
        self.virsh(&["dump", "--memory-only", "--live", &machine.name, &target])
            .await?;
        Ok(())
    }

    async fn release(&self, machine: &Machine) -> BackendResult<()> {
        if let Err(e) = self.stop(machine).await {
            warn!(machine = %machine.name, error = %e, "Stop during release failed");
            return Err(e);
        }
        Ok(())
    }
}
