use serde_json::Value;
use shared::types::{AnalysisId, Stage, TaskId};
use tokio::sync::{mpsc, oneshot};

use super::messages::ControllerMessage;
use crate::error::{OrchestratorError, Result};
use crate::machinery::{ActionReply, MachineAction};
use crate::models::{Analysis, Submission};
use crate::processing::{StageListener, StageOutcome, StageReport};

pub(crate) enum ControllerCommand {
    Message {
        message: ControllerMessage,
        reply: Option<oneshot::Sender<Result<Value>>>,
    },
    MachineReply {
        task_id: TaskId,
        machine: String,
        action: MachineAction,
        reply: ActionReply,
    },
    Shutdown,
}

/// Receiving end of the controller inbox, consumed by
/// [`StateController::spawn`](super::StateController::spawn)
pub struct ControllerInbox {
    pub(crate) commands: mpsc::UnboundedReceiver<ControllerCommand>,
}

/// Create the controller inbox. The handle can be given to other
/// components before the controller itself exists.
pub fn channel() -> (ControllerHandle, ControllerInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControllerHandle { inbox: tx }, ControllerInbox { commands: rx })
}

/// Cheap handle to the state controller.
///
/// Sending never blocks. Only [`call`](Self::call) and the helpers built on
/// it wait for the handler to run.
#[derive(Clone)]
pub struct ControllerHandle {
    inbox: mpsc::UnboundedSender<ControllerCommand>,
}

impl ControllerHandle {
    fn send(&self, command: ControllerCommand) -> Result<()> {
        self.inbox
            .send(command)
            .map_err(|_| OrchestratorError::ChannelClosed("state controller"))
    }

    /// Queue a message for sequential handling
    pub fn handle_message(&self, message: ControllerMessage) -> Result<()> {
        self.send(ControllerCommand::Message {
            message,
            reply: None,
        })
    }

    /// Queue a message and wait for its handler's answer
    pub async fn call(&self, message: ControllerMessage) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerCommand::Message {
            message,
            reply: Some(tx),
        })?;
        rx.await
            .map_err(|_| OrchestratorError::ChannelClosed("state controller"))?
    }

    pub async fn submit(&self, submission: Submission) -> Result<AnalysisId> {
        let value = self.call(ControllerMessage::Submit(submission)).await?;
        value
            .get("analysis_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OrchestratorError::Protocol("submit reply without analysis_id".into()))
    }

    pub async fn analysis(&self, analysis_id: &str) -> Result<Analysis> {
        let value = self
            .call(ControllerMessage::GetAnalysis {
                analysis_id: analysis_id.to_string(),
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn task_done(&self, task_id: &str, error: Option<String>) -> Result<()> {
        self.handle_message(ControllerMessage::TaskDone {
            task_id: task_id.to_string(),
            error,
        })
    }

    pub(crate) fn machine_reply(
        &self,
        task_id: TaskId,
        machine: String,
        action: MachineAction,
        reply: ActionReply,
    ) -> Result<()> {
        self.send(ControllerCommand::MachineReply {
            task_id,
            machine,
            action,
            reply,
        })
    }

    pub fn shutdown(&self) {
        let _ = self.inbox.send(ControllerCommand::Shutdown);
    }
}

impl StageListener for ControllerHandle {
    fn stage_done(&self, report: StageReport) {
        let StageReport {
            stage,
            item,
            outcome,
        } = report;

        let message = match (outcome, stage, item.task_id) {
            (StageOutcome::Finished(result), Stage::Identification, _) => {
                ControllerMessage::IdentificationDone {
                    analysis_id: item.analysis_id,
                    result,
                }
            }
            (StageOutcome::Finished(result), Stage::Pre, _) => ControllerMessage::PreDone {
                analysis_id: item.analysis_id,
                result,
            },
            (StageOutcome::Finished(result), Stage::Post, Some(task_id)) => {
                ControllerMessage::PostDone { task_id, result }
            }
            (StageOutcome::Finished(_), Stage::Post, None) => ControllerMessage::StageFailed {
                stage,
                analysis_id: item.analysis_id,
                task_id: None,
                error: "post work item without a task id".to_string(),
            },
            (StageOutcome::Failed(error), stage, task_id) => ControllerMessage::StageFailed {
                stage,
                analysis_id: item.analysis_id,
                task_id,
                error,
            },
        };

        if let Err(e) = self.handle_message(message) {
            tracing::error!(error = %e, "Stage report lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::types::WorkItem;

    fn next_message(inbox: &mut ControllerInbox) -> ControllerMessage {
        match inbox.commands.try_recv() {
            Ok(ControllerCommand::Message { message, .. }) => message,
            _ => panic!("expected a controller message"),
        }
    }

    #[test]
    fn test_stage_reports_map_to_messages() {
        let (handle, mut inbox) = channel();

        handle.stage_done(StageReport {
            stage: Stage::Pre,
            item: WorkItem::for_analysis("a", "/tmp/a"),
            outcome: StageOutcome::Finished(json!({"category": "file"})),
        });
        assert_eq!(
            next_message(&mut inbox),
            ControllerMessage::PreDone {
                analysis_id: "a".to_string(),
                result: json!({"category": "file"}),
            }
        );

        handle.stage_done(StageReport {
            stage: Stage::Post,
            item: WorkItem::for_task("a", "a_1", "/tmp/a"),
            outcome: StageOutcome::Failed("crashed".to_string()),
        });
        assert_eq!(
            next_message(&mut inbox),
            ControllerMessage::StageFailed {
                stage: Stage::Post,
                analysis_id: "a".to_string(),
                task_id: Some("a_1".to_string()),
                error: "crashed".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_closed_controller() {
        let (handle, inbox) = channel();
        drop(inbox);
        assert!(matches!(
            handle.task_done("a_1", None),
            Err(OrchestratorError::ChannelClosed(_))
        ));
    }
}
