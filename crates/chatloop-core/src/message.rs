//! Message model: identifiers, roles, content kinds, and message nodes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Stable identifier of a node in the message pool.
    MessageId
);
uuid_id!(
    /// Identifier of a branch within one conversation.
    BranchId
);
uuid_id!(
    /// Identifier of a conversation context.
    ConversationId
);
uuid_id!(
    /// Correlation id tying an invocation to its approval and result.
    ToolCallId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Parameter object of a tool invocation.
pub type ToolParams = serde_json::Map<String, serde_json::Value>;

/// A parsed request to execute a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: ToolCallId,
    pub tool: String,
    pub params: ToolParams,
    /// `true` = more steps follow; `false` = run this tool and end the loop.
    #[serde(rename = "continue")]
    pub continue_loop: bool,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, params: ToolParams, continue_loop: bool) -> Self {
        Self {
            id: ToolCallId::new(),
            tool: tool.into(),
            params,
            continue_loop,
        }
    }
}

/// How a tool step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Failure,
    Rejected,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub tool: String,
    pub outcome: ToolOutcome,
    pub output: String,
}

impl ToolResult {
    pub fn success(invocation: &ToolInvocation, output: impl Into<String>) -> Self {
        Self::with_outcome(invocation, ToolOutcome::Success, output)
    }

    pub fn failure(invocation: &ToolInvocation, reason: impl Into<String>) -> Self {
        Self::with_outcome(invocation, ToolOutcome::Failure, reason)
    }

    pub fn rejected(invocation: &ToolInvocation) -> Self {
        Self::with_outcome(
            invocation,
            ToolOutcome::Rejected,
            format!("Tool call '{}' was rejected by the user.", invocation.tool),
        )
    }

    pub fn aborted(invocation: &ToolInvocation, reason: impl Into<String>) -> Self {
        Self::with_outcome(invocation, ToolOutcome::Aborted, reason)
    }

    fn with_outcome(
        invocation: &ToolInvocation,
        outcome: ToolOutcome,
        output: impl Into<String>,
    ) -> Self {
        Self {
            call_id: invocation.id,
            tool: invocation.tool.clone(),
            outcome,
            output: output.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome != ToolOutcome::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_custom: bool,
}

/// Content of a message node. Matched exhaustively by every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Invocation { invocations: Vec<ToolInvocation> },
    ToolResult { result: ToolResult },
    Plan { plan: Plan },
    Question { question: Question },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// Flattened text used for transports and display.
    pub fn render(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Invocation { invocations } => invocations
                .iter()
                .map(|inv| {
                    serde_json::json!({
                        "tool": inv.tool,
                        "parameters": inv.params,
                        "continue": inv.continue_loop,
                    })
                    .to_string()
                })
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::ToolResult { result } => {
                let label = match result.outcome {
                    ToolOutcome::Success => "succeeded",
                    ToolOutcome::Failure => "failed",
                    ToolOutcome::Rejected => "was rejected",
                    ToolOutcome::Aborted => "was aborted",
                };
                format!("Tool '{}' {label}:\n{}", result.tool, result.output)
            }
            MessageContent::Plan { plan } => {
                let mut out = format!("Plan: {}", plan.goal);
                for (i, step) in plan.steps.iter().enumerate() {
                    out.push_str(&format!("\n{}. {}", i + 1, step.description));
                }
                if let Some(notes) = &plan.notes {
                    out.push_str(&format!("\nNotes: {notes}"));
                }
                out
            }
            MessageContent::Question { question } => {
                let mut out = question.question.clone();
                for option in &question.options {
                    out.push_str(&format!("\n- {option}"));
                }
                out
            }
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Lifecycle status of a node. Only `Streaming` nodes accept appended text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Failed { reason: String },
    Aborted { reason: String },
}

impl MessageStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }

    /// Marker statuses explain an abnormal termination in the history.
    pub fn is_marker(&self) -> bool {
        matches!(self, MessageStatus::Failed { .. } | MessageStatus::Aborted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageNode {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    /// Pool-wide creation order.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<MessageId>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl MessageNode {
    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    pub fn tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            MessageContent::ToolResult { result } => Some(result),
            _ => None,
        }
    }

    pub fn invocation(&self) -> Option<&ToolInvocation> {
        match &self.content {
            MessageContent::Invocation { invocations } => invocations.first(),
            _ => None,
        }
    }
}
