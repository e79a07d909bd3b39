//! Model transports.
//!
//! A [`ModelTransport`] takes the active branch of a conversation and returns
//! an ordered stream of [`TurnEvent`]s: numbered text deltas, then either
//! `Done` or `Error`. The engine never sees provider wire formats.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use chatloop_core::message::MessageNode;

pub mod openai;
pub mod scripted;
pub mod sse;

pub use openai::OpenAiTransport;
pub use scripted::{ScriptedTransport, ScriptedTurn};

/// One event of a streamed model turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Text chunk; `seq` starts at 1 and increases by one per delta.
    Delta { seq: u64, text: String },
    Error { message: String },
    Done,
}

impl TurnEvent {
    pub fn delta(seq: u64, text: impl Into<String>) -> Self {
        TurnEvent::Delta {
            seq,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        TurnEvent::Error {
            message: message.into(),
        }
    }
}

pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

/// What the model is asked to continue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    /// Instructions sent ahead of the conversation.
    pub system: Option<String>,
    /// Finalized nodes of the active branch, oldest first.
    pub messages: Vec<MessageNode>,
}

#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Transport identifier for logs (e.g. "openai", "scripted").
    fn id(&self) -> &str;

    /// Start a model turn. Errors returned here mean the request never started.
    async fn send_turn(&self, request: &TurnRequest) -> anyhow::Result<TurnStream>;
}
