//! Observability utilities: structured logging and pipeline spans
//!
//! Both the orchestrator and the stage workers initialise logging through here

pub mod logging;
pub mod spans;

pub use logging::*;
pub use spans::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Invalid logging option: {0}")]
    InvalidOption(String),
}

pub type ObservabilityResult<T> = Result<T, ObservabilityError>;
