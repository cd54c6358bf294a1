//! Processing worker handler: stage queues and the stage worker pool

pub mod handler;
pub mod launcher;
pub mod queue;
pub mod slot;

pub use handler::{
    HandlerStatus, StageListener, StageOutcome, StageReport, WorkerHandler, WorkerHandlerHandle,
};
pub use launcher::{
    BoxedStream, InProcessLauncher, LaunchedWorker, ProcessLauncher, WorkerLauncher,
    WorkerProcess, WorkerStream,
};
pub use queue::StageQueues;
pub use slot::{SlotState, SlotStatus};
