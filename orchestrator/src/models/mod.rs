pub mod analysis;
pub mod machine;
pub mod task;

pub use analysis::{
    Analysis, AnalysisSettings, AnalysisState, Submission, SubmissionSettings, SubmissionTarget,
};
pub use machine::{Availability, Machine};
pub use task::{Task, TaskState};
