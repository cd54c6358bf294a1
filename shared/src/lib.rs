//! Shared types and plumbing for the Nexus-Security sandbox orchestrator
//!
//! Everything in here is used on both sides of a process boundary: the
//! orchestrator and the stage worker processes it launches.

// Re-export common dependencies
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;

pub mod messaging;
pub mod observability;
pub mod types;
