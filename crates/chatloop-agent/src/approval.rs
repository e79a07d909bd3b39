//! Approval hand-off between the loop controller and the caller.
//!
//! The controller arms the slot while it still holds the conversation lock,
//! then waits on the receiver with the lock released. `Engine::approve` and
//! `Engine::reject` resolve it from any task.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use chatloop_core::message::ToolCallId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug)]
struct Waiter {
    call_id: ToolCallId,
    tx: oneshot::Sender<ApprovalDecision>,
}

/// At most one outstanding approval per conversation.
#[derive(Debug, Default)]
pub struct ApprovalSlot {
    waiter: Mutex<Option<Waiter>>,
}

impl ApprovalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the decision for `call_id`, replacing any stale waiter.
    pub fn arm(&self, call_id: ToolCallId) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let mut waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner);
        *waiter = Some(Waiter { call_id, tx });
        rx
    }

    /// Deliver a decision. Returns false when nothing waits on `call_id`.
    pub fn resolve(&self, call_id: ToolCallId, decision: ApprovalDecision) -> bool {
        let mut waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner);
        match waiter.take() {
            Some(w) if w.call_id == call_id => w.tx.send(decision).is_ok(),
            other => {
                debug!(%call_id, ?decision, "No approval waiting for this call");
                *waiter = other;
                false
            }
        }
    }

    pub fn pending(&self) -> Option<ToolCallId> {
        let waiter = self.waiter.lock().unwrap_or_else(PoisonError::into_inner);
        waiter.as_ref().map(|w| w.call_id)
    }

    pub fn clear(&self) {
        self.waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_matching_call() {
        let slot = ApprovalSlot::new();
        let call = ToolCallId::new();
        let rx = slot.arm(call);
        assert_eq!(slot.pending(), Some(call));

        assert!(!slot.resolve(ToolCallId::new(), ApprovalDecision::Approve));
        assert_eq!(slot.pending(), Some(call));

        assert!(slot.resolve(call, ApprovalDecision::Reject));
        assert_eq!(rx.await.unwrap(), ApprovalDecision::Reject);
        assert!(slot.pending().is_none());
        assert!(!slot.resolve(call, ApprovalDecision::Approve));
    }

    #[tokio::test]
    async fn test_clear_drops_sender() {
        let slot = ApprovalSlot::new();
        let rx = slot.arm(ToolCallId::new());
        slot.clear();
        assert!(rx.await.is_err());
    }
}
