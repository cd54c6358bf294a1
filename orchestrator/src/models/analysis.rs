use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{AnalysisId, PlatformRequest, SubmittedTarget, TargetDescriptor, TaskId};

use crate::error::{OrchestratorError, Result};

/// Lifecycle of an analysis.
///
/// `pending -> identified -> pre_done -> reported`, with `cancelled` and
/// `fatal_error` as the other terminal states. Running is implicit: an
/// analysis in `pre_done` with unfinished tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Identified,
    PreDone,
    Reported,
    Cancelled,
    FatalError,
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisState::Reported | AnalysisState::Cancelled | AnalysisState::FatalError
        )
    }

    pub fn can_transition_to(&self, next: AnalysisState) -> bool {
        use AnalysisState::*;
        matches!(
            (self, next),
            (Pending, Identified)
                | (Pending, Cancelled)
                | (Pending, FatalError)
                | (Identified, PreDone)
                | (Identified, FatalError)
                | (PreDone, Reported)
                | (PreDone, FatalError)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Pending => "pending",
            AnalysisState::Identified => "identified",
            AnalysisState::PreDone => "pre_done",
            AnalysisState::Reported => "reported",
            AnalysisState::Cancelled => "cancelled",
            AnalysisState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client hands to `submit`, before staging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SubmissionTarget {
    File {
        path: PathBuf,
        #[serde(default)]
        filename: Option<String>,
    },
    Url {
        url: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionSettings {
    #[serde(default)]
    pub platforms: Vec<PlatformRequest>,
    /// Seconds; zero or missing means the configured default
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// Machine tags every task of this analysis requires
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub target: SubmissionTarget,
    #[serde(default)]
    pub settings: SubmissionSettings,
}

/// Settings after defaults and limits have been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub platforms: Vec<PlatformRequest>,
    pub timeout: u64,
    pub priority: u32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: AnalysisId,
    pub state: AnalysisState,
    pub created_at: DateTime<Utc>,
    pub submitted: SubmittedTarget,
    pub settings: AnalysisSettings,
    /// Selected target, set once identification completes
    #[serde(default)]
    pub target: Option<TargetDescriptor>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskId>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Analysis {
    pub fn new(id: AnalysisId, submitted: SubmittedTarget, settings: AnalysisSettings) -> Self {
        Self {
            id,
            state: AnalysisState::Pending,
            created_at: Utc::now(),
            submitted,
            settings,
            target: None,
            category: None,
            tasks: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Move to `next`, refusing anything the state machine does not allow
    pub fn set_state(&mut self, next: AnalysisState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == AnalysisState::PreDone && !self.tasks.is_empty()
    }
}
