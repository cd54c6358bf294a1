use serde::Serialize;
use shared::messaging::IpcWriter;
use shared::types::{Stage, WorkItem};
use tokio::io::WriteHalf;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::launcher::{BoxedStream, WorkerProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Launched, waiting for `READY`
    Setup,
    Idle,
    Working,
    /// Result reported, waiting for the worker's `READY` before new work
    Returning,
    /// Retired after `SETUP_FAIL` or too many restarts
    Unusable,
}

/// Handler-side state of one worker process
pub(crate) struct WorkerSlot {
    pub name: String,
    pub stage: Stage,
    pub state: SlotState,
    /// Bumped on every launch; events from older incarnations are ignored
    pub generation: u64,
    pub restarts: u32,
    pub writer: Option<IpcWriter<WriteHalf<BoxedStream>>>,
    pub process: Option<Box<dyn WorkerProcess>>,
    pub launch_task: Option<JoinHandle<()>>,
    pub reader_task: Option<JoinHandle<()>>,
    pub current: Option<WorkItem>,
    /// Setup or reporting deadline, whichever applies to `state`
    pub deadline: Option<Instant>,
    /// Why the slot was last retired or failed setup
    pub last_error: Option<String>,
}

impl WorkerSlot {
    pub fn new(name: String, stage: Stage) -> Self {
        Self {
            name,
            stage,
            state: SlotState::Setup,
            generation: 0,
            restarts: 0,
            writer: None,
            process: None,
            launch_task: None,
            reader_task: None,
            current: None,
            deadline: None,
            last_error: None,
        }
    }

    pub fn is_idle_for(&self, stage: Stage) -> bool {
        self.stage == stage && self.state == SlotState::Idle && self.writer.is_some()
    }

    /// Stop the process and drop everything tied to the current incarnation
    pub fn kill(&mut self) {
        if let Some(task) = self.launch_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
        self.writer = None;
        self.deadline = None;
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            name: self.name.clone(),
            stage: self.stage,
            state: self.state,
            restarts: self.restarts,
            current: self.current.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub name: String,
    pub stage: Stage,
    pub state: SlotState,
    pub restarts: u32,
    pub current: Option<WorkItem>,
    pub last_error: Option<String>,
}
