//! Nexus sandbox orchestration core
//!
//! - [`controller`]: the state controller, sole writer of analysis and task state
//! - [`processing`]: the processing worker handler and its stage worker pool
//! - [`machinery`]: the machinery manager and virtualization backends
//! - [`worker`]: the stage worker side of the processing protocol

pub mod config;
pub mod controller;
pub mod error;
pub mod machinery;
pub mod models;
pub mod processing;
pub mod runner;
pub mod storage;
pub mod worker;

pub use config::Config;
pub use error::{OrchestratorError, Result};
