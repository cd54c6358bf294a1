use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{AnalysisId, Platform, TaskId};

use crate::error::{OrchestratorError, Result};

/// Lifecycle of a task: `pending -> running -> pending_post -> reported`,
/// with `fatal_error` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    PendingPost,
    Reported,
    FatalError,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Reported | TaskState::FatalError)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, FatalError)
                | (Running, PendingPost)
                | (Running, FatalError)
                | (PendingPost, Reported)
                | (PendingPost, FatalError)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::PendingPost => "pending_post",
            TaskState::Reported => "reported",
            TaskState::FatalError => "fatal_error",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub analysis_id: AnalysisId,
    pub number: usize,
    pub platform: Platform,
    pub state: TaskState,
    /// Machine bound to this task; only set while a machine is held
    #[serde(default)]
    pub machine: Option<String>,
    pub timeout: u64,
    pub priority: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Task {
    pub fn new(
        analysis_id: &str,
        number: usize,
        platform: Platform,
        timeout: u64,
        priority: u32,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: shared::types::task_id(analysis_id, number),
            analysis_id: analysis_id.to_string(),
            number,
            platform,
            state: TaskState::Pending,
            machine: None,
            timeout,
            priority,
            tags,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
        }
    }

    /// Move to `next`. Entering `running` requires a bound machine.
    pub fn set_state(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == TaskState::Running && self.machine.is_none() {
            return Err(OrchestratorError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: format!("{} (no machine bound)", next),
            });
        }

        match next {
            TaskState::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("20240101-AAAAAA", 1, Platform::new("windows", "10"), 120, 1, vec![])
    }

    #[test]
    fn test_task_id_is_derived_from_analysis() {
        assert_eq!(task().id, "20240101-AAAAAA_1");
    }

    #[test]
    fn test_running_requires_machine() {
        let mut t = task();
        assert!(t.set_state(TaskState::Running).is_err());
        assert_eq!(t.state, TaskState::Pending);

        t.machine = Some("win10-1".to_string());
        t.set_state(TaskState::Running).unwrap();
        assert!(t.started_at.is_some());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut t = task();
        t.machine = Some("win10-1".to_string());
        t.set_state(TaskState::Running).unwrap();
        t.set_state(TaskState::PendingPost).unwrap();
        t.set_state(TaskState::Reported).unwrap();
        assert!(t.finished_at.is_some());
        assert!(t.set_state(TaskState::FatalError).is_err());
    }

    #[test]
    fn test_pending_cannot_skip_to_reported() {
        let mut t = task();
        assert!(t.set_state(TaskState::Reported).is_err());
        assert!(t.set_state(TaskState::PendingPost).is_err());
        t.set_state(TaskState::FatalError).unwrap();
    }
}
