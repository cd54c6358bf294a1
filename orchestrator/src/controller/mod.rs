//! State controller: the only writer of analysis and task state
//!
//! Stage completions arrive from the worker handler, machine replies from
//! the machinery manager and submissions from the controller socket. All
//! of them go through one inbox and are handled in order.

pub mod handle;
pub mod messages;
pub mod policy;
pub mod server;
mod state;

pub use handle::{channel, ControllerHandle, ControllerInbox};
pub use messages::ControllerMessage;
pub use server::{ControllerServer, ServerReply};
pub use state::StateController;
