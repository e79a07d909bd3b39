//! Core of the chatloop conversation engine: message model, pool and
//! branches, streaming assembly, tool-call protocol, the conversation state
//! machine, configuration, and persistence.

pub mod assembler;
pub mod branch;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod role;
pub mod state;
pub mod store;
pub mod store_jsonl;

pub use context::{ConversationContext, ConversationSnapshot, StreamStep};
pub use error::{EngineError, LoopLimit, Result};
pub use event::{ConversationEvent, EngineEvent, TerminationReason};
pub use role::{AgentRole, CapabilityRegistry};
pub use state::ConversationState;
