//! Agent runtime: drives model turns and tool turns for a conversation.
//!
//! [`Engine`] owns every loaded conversation and serializes mutations per
//! conversation. [`Engine::send_message`] submits a user message and runs the
//! agent loop until it terminates, producing a [`LoopReport`]. Progress is
//! published as [`ConversationEvent`]s on the channel given to the builder.

use serde::{Deserialize, Serialize};

use chatloop_core::error::{EngineError, Result};
use chatloop_core::event::TerminationReason;
use chatloop_core::message::{ConversationId, MessageId};

pub mod approval;
mod controller;
pub mod engine;
pub mod prompt;

pub use approval::ApprovalDecision;
pub use chatloop_core::event::ConversationEvent;
pub use engine::{Engine, EngineBuilder};

/// Summary of one agent loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub conversation_id: ConversationId,
    pub reason: TerminationReason,
    /// Model requests issued, including the one that tripped a bound.
    pub iterations: u32,
    pub tool_calls: u32,
    /// Corrective instructions sent after malformed tool calls.
    pub malformed_retries: u32,
    pub duration_ms: u64,
    /// The plain-text (or plan/question) reply that ended the loop, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_message: Option<MessageId>,
}

impl LoopReport {
    pub fn is_normal(&self) -> bool {
        self.reason.is_normal()
    }

    /// Turn bounded terminations into errors for callers that want `?`.
    ///
    /// Rejection and cancellation are caller decisions and stay `Ok`.
    pub fn into_result(self) -> Result<Self> {
        match &self.reason {
            TerminationReason::ProtocolViolation { attempts } => {
                Err(EngineError::ProtocolViolation { attempts: *attempts })
            }
            TerminationReason::LimitExceeded { limit } => Err(EngineError::LoopLimitExceeded(*limit)),
            _ => Ok(self),
        }
    }
}
