//! Shared type definitions for the sandbox orchestration pipeline
//!
//! - Identifiers for analyses and tasks
//! - Processing stages and platforms
//! - The on-disk stage artifacts exchanged between the orchestrator and
//!   the stage workers (`identification.json`, `pre.json`, `post.json`)

pub mod artifacts;
pub mod common;

pub use artifacts::{
    read_artifact, write_artifact, AnalysisHeader, Identification, PostResult, PreResult,
    TargetDescriptor, ANALYSIS_FILE, IDENTIFICATION_FILE, POST_FILE, PRE_FILE, TARGET_ZIP,
    TASK_FILE,
};
pub use common::{
    analysis_id_of_task, new_analysis_id, task_id, AnalysisId, ParseStageError, Platform,
    PlatformRequest, Stage, SubmittedTarget, TaskId, WorkItem,
};
