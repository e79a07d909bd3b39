use std::fmt;

use serde::{Deserialize, Serialize};

/// What a conversation is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    Idle,
    AwaitingModel,
    StreamingResponse,
    AwaitingToolApproval,
    ExecutingTool,
    /// Entered on a transport or tool error; left via recovery to `Idle`.
    Errored,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::AwaitingModel => "awaiting_model",
            ConversationState::StreamingResponse => "streaming_response",
            ConversationState::AwaitingToolApproval => "awaiting_tool_approval",
            ConversationState::ExecutingTool => "executing_tool",
            ConversationState::Errored => "errored",
        }
    }

    /// States from which `handle_model_error` is accepted.
    pub fn accepts_model_error(&self) -> bool {
        matches!(
            self,
            ConversationState::AwaitingModel
                | ConversationState::StreamingResponse
                | ConversationState::ExecutingTool
        )
    }

    /// True while an agent loop owns the conversation.
    pub fn is_busy(&self) -> bool {
        !matches!(self, ConversationState::Idle | ConversationState::Errored)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(ConversationState::default(), ConversationState::Idle);
        assert!(!ConversationState::Idle.is_busy());
        assert!(ConversationState::AwaitingToolApproval.is_busy());
    }

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_value(ConversationState::AwaitingToolApproval).unwrap();
        assert_eq!(json, "awaiting_tool_approval");
        assert_eq!(ConversationState::ExecutingTool.to_string(), "executing_tool");
    }
}
