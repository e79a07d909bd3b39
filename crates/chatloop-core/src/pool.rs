//! Append-only message pool.
//!
//! Nodes live in an arena addressed by [`MessageId`]. Finalized nodes are never
//! mutated; the only write path into an existing node is the streaming append,
//! which is accepted while the node's status is `Streaming`.

use std::collections::HashMap;

use chrono::Utc;

use crate::error::{EngineError, Result};
use crate::message::{MessageContent, MessageId, MessageNode, MessageStatus, Role};

#[derive(Debug, Clone, Default)]
pub struct MessagePool {
    nodes: Vec<MessageNode>,
    index: HashMap<MessageId, usize>,
    next_seq: u64,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a finalized node. Fails with `UnknownParent` if `parent` is not in the pool.
    pub fn create_node(
        &mut self,
        role: Role,
        content: MessageContent,
        parent: Option<MessageId>,
    ) -> Result<MessageId> {
        self.insert(role, content, parent, MessageStatus::Complete)
    }

    /// Create a node that still accepts streamed text.
    pub fn create_streaming_node(&mut self, role: Role, parent: Option<MessageId>) -> Result<MessageId> {
        self.insert(role, MessageContent::text(""), parent, MessageStatus::Streaming)
    }

    /// Create a finalized node carrying a failure/abort marker.
    pub fn create_marker(
        &mut self,
        role: Role,
        content: MessageContent,
        parent: Option<MessageId>,
        status: MessageStatus,
    ) -> Result<MessageId> {
        self.insert(role, content, parent, status)
    }

    fn insert(
        &mut self,
        role: Role,
        content: MessageContent,
        parent: Option<MessageId>,
        status: MessageStatus,
    ) -> Result<MessageId> {
        if let Some(parent_id) = parent {
            if !self.index.contains_key(&parent_id) {
                return Err(EngineError::UnknownParent(parent_id.to_string()));
            }
        }

        let id = MessageId::new();
        self.next_seq += 1;
        let node = MessageNode {
            id,
            role,
            content,
            seq: self.next_seq,
            parent,
            status,
            created_at: Utc::now(),
        };
        self.index.insert(id, self.nodes.len());
        self.nodes.push(node);
        Ok(id)
    }

    pub fn get(&self, id: MessageId) -> Result<&MessageNode> {
        self.index
            .get(&id)
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| EngineError::NotFound(format!("message {id}")))
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.index.contains_key(&id)
    }

    /// Append streamed text to a node that is still `Streaming`.
    pub fn append_streaming_text(&mut self, id: MessageId, chunk: &str) -> Result<()> {
        let node = self.get_mut(id)?;
        if !node.is_streaming() {
            return Err(EngineError::NoOpenStream);
        }
        match &mut node.content {
            MessageContent::Text { text } => text.push_str(chunk),
            // A streaming node is created as text and keeps that variant until finalized.
            _ => return Err(EngineError::NoOpenStream),
        }
        Ok(())
    }

    /// Seal a streaming node with its final content and status.
    pub fn finalize(
        &mut self,
        id: MessageId,
        content: MessageContent,
        status: MessageStatus,
    ) -> Result<&MessageNode> {
        let node = self.get_mut(id)?;
        if !node.is_streaming() {
            return Err(EngineError::NoOpenStream);
        }
        node.content = content;
        node.status = status;
        Ok(node)
    }

    /// Re-insert a node loaded from a store, preserving its id and sequence number.
    pub fn restore(&mut self, node: MessageNode) {
        if self.index.contains_key(&node.id) {
            return;
        }
        self.next_seq = self.next_seq.max(node.seq);
        self.index.insert(node.id, self.nodes.len());
        self.nodes.push(node);
    }

    fn get_mut(&mut self, id: MessageId) -> Result<&mut MessageNode> {
        match self.index.get(&id) {
            Some(&i) => Ok(&mut self.nodes[i]),
            None => Err(EngineError::NotFound(format!("message {id}"))),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageNode> {
        self.nodes.iter()
    }
}
