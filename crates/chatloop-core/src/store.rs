//! Conversation persistence boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::branch::BranchSet;
use crate::error::{EngineError, Result};
use crate::message::{BranchId, ConversationId, MessageId, MessageNode};
use crate::role::AgentRole;

/// Listing entry for a stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub role: AgentRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Everything needed to rebuild a conversation context.
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub meta: ConversationMeta,
    pub nodes: Vec<MessageNode>,
    pub branches: BranchSet,
}

/// Storage for message pools and branch sets.
///
/// Nodes are only ever appended; branch state is replaced as a whole and
/// must be written atomically.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_node(&self, conversation: ConversationId, node: &MessageNode) -> Result<()>;

    async fn fetch_node(&self, conversation: ConversationId, id: MessageId) -> Result<Option<MessageNode>>;

    async fn save_branches(&self, conversation: ConversationId, branches: &BranchSet) -> Result<()>;

    /// Switch the stored active branch without rewriting anything else.
    async fn set_active_branch(&self, conversation: ConversationId, branch: BranchId) -> Result<()>;

    async fn save_meta(&self, meta: &ConversationMeta) -> Result<()>;

    async fn load(&self, conversation: ConversationId) -> Result<Option<StoredConversation>>;

    /// All conversations, most recently updated first.
    async fn list(&self) -> Result<Vec<ConversationMeta>>;

    async fn delete(&self, conversation: ConversationId) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryEntry {
    meta: Option<ConversationMeta>,
    nodes: Vec<MessageNode>,
    branches: Option<BranchSet>,
}

/// In-process store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    entries: RwLock<HashMap<ConversationId, MemoryEntry>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_node(&self, conversation: ConversationId, node: &MessageNode) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(conversation).or_default();
        if !entry.nodes.iter().any(|n| n.id == node.id) {
            entry.nodes.push(node.clone());
        }
        Ok(())
    }

    async fn fetch_node(&self, conversation: ConversationId, id: MessageId) -> Result<Option<MessageNode>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&conversation)
            .and_then(|e| e.nodes.iter().find(|n| n.id == id).cloned()))
    }

    async fn save_branches(&self, conversation: ConversationId, branches: &BranchSet) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(conversation).or_default().branches = Some(branches.clone());
        Ok(())
    }

    async fn set_active_branch(&self, conversation: ConversationId, branch: BranchId) -> Result<()> {
        let mut entries = self.entries.write().await;
        let branches = entries
            .get_mut(&conversation)
            .and_then(|e| e.branches.as_mut())
            .ok_or_else(|| EngineError::NotFound(format!("conversation {conversation}")))?;
        branches.set_active(branch)
    }

    async fn save_meta(&self, meta: &ConversationMeta) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.entry(meta.id).or_default().meta = Some(meta.clone());
        Ok(())
    }

    async fn load(&self, conversation: ConversationId) -> Result<Option<StoredConversation>> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(&conversation) else {
            return Ok(None);
        };
        let (Some(meta), Some(branches)) = (&entry.meta, &entry.branches) else {
            return Ok(None);
        };
        Ok(Some(StoredConversation {
            meta: meta.clone(),
            nodes: entry.nodes.clone(),
            branches: branches.clone(),
        }))
    }

    async fn list(&self) -> Result<Vec<ConversationMeta>> {
        let entries = self.entries.read().await;
        let mut metas: Vec<ConversationMeta> = entries.values().filter_map(|e| e.meta.clone()).collect();
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn delete(&self, conversation: ConversationId) -> Result<()> {
        self.entries.write().await.remove(&conversation);
        Ok(())
    }
}
