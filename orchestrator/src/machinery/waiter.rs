use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::action::{ActionReply, ActionRequest, Fallback, MachineAction};
use super::backend::MachineState;

/// An issued action waiting for its machine to reach `expected_state`
#[derive(Debug)]
pub(crate) struct Waiter {
    pub id: Uuid,
    pub machine: String,
    pub action: MachineAction,
    pub expected_state: MachineState,
    pub deadline: Instant,
    pub fallback: Option<Fallback>,
    /// Gone once the requester has been answered
    pub reply: Option<oneshot::Sender<ActionReply>>,
}

impl Waiter {
    pub fn new(
        id: Uuid,
        request: &ActionRequest,
        deadline: Instant,
        reply: oneshot::Sender<ActionReply>,
    ) -> Self {
        Self {
            id,
            machine: request.machine.clone(),
            action: request.action,
            expected_state: request.expected_state,
            deadline,
            fallback: request.fallback,
            reply: Some(reply),
        }
    }

    /// Waiter for a fallback action. Nobody is waiting for its reply.
    pub fn for_fallback(machine: &str, fallback: Fallback, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            machine: machine.to_string(),
            action: fallback.action,
            expected_state: fallback.expected_state,
            deadline: now + fallback.timeout,
            fallback: None,
            reply: None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Answer the requester, if still unanswered
    pub fn resolve(&mut self, reply: ActionReply) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(reply);
        }
    }
}
