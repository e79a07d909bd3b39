use thiserror::Error;

use crate::state::ConversationState;

/// Which loop bound was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopLimit {
    Iterations,
    WallClock,
    ToolFailures,
}

impl std::fmt::Display for LoopLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopLimit::Iterations => f.write_str("iteration ceiling"),
            LoopLimit::WallClock => f.write_str("wall-clock budget"),
            LoopLimit::ToolFailures => f.write_str("consecutive tool failure limit"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A streaming delta skipped ahead of the next expected sequence number.
    #[error("Out-of-order delta: expected seq {expected}, got {got}")]
    OutOfOrderDelta { expected: u64, got: u64 },

    #[error("A streaming buffer is already open for message {0}")]
    StreamAlreadyOpen(String),

    #[error("No streaming buffer is open")]
    NoOpenStream,

    #[error("Unknown parent message: {0}")]
    UnknownParent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed tool invocation: {0}")]
    MalformedInvocation(String),

    #[error("Protocol violation: {attempts} consecutive malformed tool invocations")]
    ProtocolViolation { attempts: u32 },

    #[error("Agent loop exceeded its {0}")]
    LoopLimitExceeded(LoopLimit),

    #[error("Conversation is busy ({0})")]
    Busy(ConversationState),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors the caller can recover from without discarding the conversation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfOrderDelta { .. }
                | EngineError::MalformedInvocation(_)
                | EngineError::ProtocolViolation { .. }
                | EngineError::LoopLimitExceeded(_)
                | EngineError::Busy(_)
                | EngineError::Transport(_)
                | EngineError::Tool(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
