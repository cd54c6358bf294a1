//! Task runners
//!
//! What happens inside a running machine is not the orchestrator's
//! business. A runner is started once a task's machine is up and must
//! eventually report `task_done` back to the controller.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use shared::observability::task_span;
use shared::types::{AnalysisId, Platform, TaskId};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn, Instrument};

use crate::controller::ControllerHandle;
use crate::error::{OrchestratorError, Result};

/// Extra time a runner gets on top of the task timeout before it is killed
const RUNNER_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub analysis_id: AnalysisId,
    pub machine: String,
    pub machine_ip: Option<String>,
    pub platform: Platform,
    /// Seconds
    pub timeout: u64,
    /// Path of the staged file or `target.zip`, or the submitted URL
    pub target: String,
    pub task_path: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Start running a task. Returning `Ok` means the runner has taken
    /// over and will report completion.
    async fn start(&self, assignment: TaskAssignment) -> Result<()>;
}

/// Runs a configured command per task:
/// `<command> <task_id> <machine> <machine_ip> <target>`
pub struct CommandTaskRunner {
    program: String,
    args: Vec<String>,
    controller: ControllerHandle,
}

impl CommandTaskRunner {
    pub fn new(command: &str, controller: ControllerHandle) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| OrchestratorError::SetupFailed {
                target: "task runner".to_string(),
                reason: "command is empty".to_string(),
            })?;
        Ok(Self {
            program,
            args: parts.collect(),
            controller,
        })
    }
}

#[async_trait]
impl TaskRunner for CommandTaskRunner {
    async fn start(&self, assignment: TaskAssignment) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&assignment.task_id)
            .arg(&assignment.machine)
            .arg(assignment.machine_ip.as_deref().unwrap_or(""))
            .arg(&assignment.target)
            .env("NEXUS_TASK_ID", &assignment.task_id)
            .env("NEXUS_ANALYSIS_ID", &assignment.analysis_id)
            .env("NEXUS_TASK_DIR", &assignment.task_path)
            .env("NEXUS_TASK_TIMEOUT", assignment.timeout.to_string())
            .env("NEXUS_PLATFORM", assignment.platform.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(task_id = %assignment.task_id, program = %self.program, "Task runner started");

        let controller = self.controller.clone();
        let limit = Duration::from_secs(assignment.timeout) + RUNNER_GRACE;
        let task_id = assignment.task_id.clone();
        tokio::spawn(
            async move {
                let error = match timeout(limit, child.wait()).await {
                    Ok(Ok(status)) if status.success() => None,
                    Ok(Ok(status)) => Some(format!("task runner exited with {}", status)),
                    Ok(Err(e)) => Some(format!("waiting for task runner failed: {}", e)),
                    Err(_) => {
                        let _ = child.start_kill();
                        Some(format!("task runner still running after {}s", limit.as_secs()))
                    }
                };
                if let Some(error) = &error {
                    warn!(error = %error, "Task run failed");
                }
                if let Err(e) = controller.task_done(&task_id, error) {
                    warn!(error = %e, "Could not report task completion");
                }
            }
            .instrument(task_span(&assignment.task_id)),
        );
        Ok(())
    }
}

/// Reports every task as done as soon as it starts. Used when no runner
/// command is configured.
pub struct ImmediateTaskRunner {
    controller: ControllerHandle,
}

impl ImmediateTaskRunner {
    pub fn new(controller: ControllerHandle) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl TaskRunner for ImmediateTaskRunner {
    async fn start(&self, assignment: TaskAssignment) -> Result<()> {
        info!(task_id = %assignment.task_id, "No task runner configured, completing task");
        self.controller.task_done(&assignment.task_id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{channel, ControllerMessage};
    use crate::controller::handle::ControllerCommand;

    fn assignment() -> TaskAssignment {
        TaskAssignment {
            task_id: "20240101-AAAAAA_1".to_string(),
            analysis_id: "20240101-AAAAAA".to_string(),
            machine: "win10-1".to_string(),
            machine_ip: Some("192.168.56.101".to_string()),
            platform: Platform::new("windows", "10"),
            timeout: 1,
            target: "/tmp/sample.exe".to_string(),
            task_path: PathBuf::from("/tmp/20240101-AAAAAA_1"),
        }
    }

    async fn reported(inbox: &mut crate::controller::ControllerInbox) -> ControllerMessage {
        match inbox.commands.recv().await {
            Some(ControllerCommand::Message { message, .. }) => message,
            _ => panic!("expected a task_done message"),
        }
    }

    #[tokio::test]
    async fn test_command_runner_reports_exit_status() {
        let (handle, mut inbox) = channel();

        let ok = CommandTaskRunner::new("true", handle.clone()).unwrap();
        ok.start(assignment()).await.unwrap();
        assert_eq!(
            reported(&mut inbox).await,
            ControllerMessage::TaskDone {
                task_id: "20240101-AAAAAA_1".to_string(),
                error: None
            }
        );

        let failing = CommandTaskRunner::new("false", handle).unwrap();
        failing.start(assignment()).await.unwrap();
        match reported(&mut inbox).await {
            ControllerMessage::TaskDone { error: Some(error), .. } => {
                assert!(error.contains("exited"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_runner_binary_is_an_error() {
        let (handle, _inbox) = channel();
        let runner = CommandTaskRunner::new("/nonexistent/nexus-runner --flag", handle).unwrap();
        assert!(runner.start(assignment()).await.is_err());
        assert!(CommandTaskRunner::new("   ", channel().0).is_err());
    }

    #[tokio::test]
    async fn test_immediate_runner() {
        let (handle, mut inbox) = channel();
        ImmediateTaskRunner::new(handle).start(assignment()).await.unwrap();
        assert!(matches!(
            reported(&mut inbox).await,
            ControllerMessage::TaskDone { error: None, .. }
        ));
    }
}
