//! Caller-facing events emitted by a conversation.

use serde::{Deserialize, Serialize};

use crate::error::LoopLimit;
use crate::message::{ConversationId, MessageId, MessageNode, ToolCallId, ToolParams};
use crate::state::ConversationState;

/// Why an agent loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    Normal,
    LimitExceeded { limit: LoopLimit },
    ProtocolViolation { attempts: u32 },
    Rejected { call_id: ToolCallId },
    Cancelled,
}

impl TerminationReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, TerminationReason::Normal)
    }

    /// Text for the marker node appended when a loop is force-terminated.
    pub fn marker_text(&self) -> String {
        match self {
            TerminationReason::Normal => "Agent loop finished.".to_string(),
            TerminationReason::LimitExceeded { limit } => {
                format!("Agent loop aborted: exceeded its {limit}.")
            }
            TerminationReason::ProtocolViolation { attempts } => format!(
                "Agent loop aborted: {attempts} consecutive responses contained malformed tool calls."
            ),
            TerminationReason::Rejected { .. } => "Agent loop stopped: tool call rejected.".to_string(),
            TerminationReason::Cancelled => "Agent loop cancelled.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A finalized node joined the active branch.
    MessageAppended { node: MessageNode },

    /// Streaming text for an in-flight assistant message.
    StreamingDelta { message_id: MessageId, text: String },

    ApprovalRequested {
        call_id: ToolCallId,
        tool: String,
        params: ToolParams,
    },

    LoopTerminated { reason: TerminationReason },

    Errored { message: String },

    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
}

/// An event tagged with the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub conversation_id: ConversationId,
    #[serde(flatten)]
    pub event: EngineEvent,
}
