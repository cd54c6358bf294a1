use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::types::{AnalysisId, Stage, TaskId};

use crate::error::{OrchestratorError, Result};
use crate::models::Submission;

/// Everything the state controller can be asked to do.
///
/// On the wire a message is `{"subject": "...", "payload": {...}}`. An
/// unknown subject or a payload of the wrong shape fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", content = "payload", rename_all = "snake_case")]
pub enum ControllerMessage {
    Submit(Submission),
    /// `result` is the stage worker's `FINISHED` payload
    IdentificationDone {
        analysis_id: AnalysisId,
        #[serde(default)]
        result: Value,
    },
    PreDone {
        analysis_id: AnalysisId,
        #[serde(default)]
        result: Value,
    },
    /// The task runner finished; `error` is set when the run failed
    TaskDone {
        task_id: TaskId,
        #[serde(default)]
        error: Option<String>,
    },
    PostDone {
        task_id: TaskId,
        #[serde(default)]
        result: Value,
    },
    StageFailed {
        stage: Stage,
        analysis_id: AnalysisId,
        #[serde(default)]
        task_id: Option<TaskId>,
        error: String,
    },
    DisableMachine {
        machine: String,
    },
    GetAnalysis {
        analysis_id: AnalysisId,
    },
}

impl ControllerMessage {
    /// Decode one frame
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| OrchestratorError::Protocol(e.to_string()))
    }

    pub fn subject(&self) -> &'static str {
        match self {
            ControllerMessage::Submit(_) => "submit",
            ControllerMessage::IdentificationDone { .. } => "identification_done",
            ControllerMessage::PreDone { .. } => "pre_done",
            ControllerMessage::TaskDone { .. } => "task_done",
            ControllerMessage::PostDone { .. } => "post_done",
            ControllerMessage::StageFailed { .. } => "stage_failed",
            ControllerMessage::DisableMachine { .. } => "disable_machine",
            ControllerMessage::GetAnalysis { .. } => "get_analysis",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubmissionSettings, SubmissionTarget};
    use pretty_assertions::assert_eq;
    use shared::types::PlatformRequest;

    #[test]
    fn test_submit_frame() {
        let frame = r#"{"subject":"submit","payload":{"target":{"type":"url","url":"https://example.com"},"settings":{"platforms":[{"platform":"windows","os_version":"10"}]}}}"#;
        let message = ControllerMessage::decode(frame).unwrap();
        assert_eq!(
            message,
            ControllerMessage::Submit(Submission {
                target: SubmissionTarget::Url {
                    url: "https://example.com".to_string()
                },
                settings: SubmissionSettings {
                    platforms: vec![PlatformRequest::exact("windows", "10")],
                    ..Default::default()
                },
            })
        );
        assert_eq!(message.subject(), "submit");
    }

    #[test]
    fn test_task_done_error_is_optional() {
        let message =
            ControllerMessage::decode(r#"{"subject":"task_done","payload":{"task_id":"20240101-AAAAAA_1"}}"#)
                .unwrap();
        assert_eq!(
            message,
            ControllerMessage::TaskDone {
                task_id: "20240101-AAAAAA_1".to_string(),
                error: None
            }
        );
    }

    #[test]
    fn test_stage_result_is_optional() {
        let bare =
            ControllerMessage::decode(r#"{"subject":"pre_done","payload":{"analysis_id":"20240101-AAAAAA"}}"#)
                .unwrap();
        assert_eq!(
            bare,
            ControllerMessage::PreDone {
                analysis_id: "20240101-AAAAAA".to_string(),
                result: Value::Null,
            }
        );

        let with_result = ControllerMessage::decode(
            r#"{"subject":"post_done","payload":{"task_id":"20240101-AAAAAA_1","result":{"score":3}}}"#,
        )
        .unwrap();
        assert_eq!(
            with_result,
            ControllerMessage::PostDone {
                task_id: "20240101-AAAAAA_1".to_string(),
                result: serde_json::json!({"score": 3}),
            }
        );
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        for frame in [
            r#"{"payload":{"analysis_id":"x"}}"#,
            r#"{"subject":"reboot_everything","payload":{}}"#,
            r#"{"subject":"pre_done","payload":{"task":"x"}}"#,
            "not json",
        ] {
            assert!(matches!(
                ControllerMessage::decode(frame),
                Err(OrchestratorError::Protocol(_))
            ));
        }
    }
}
