//! JSONL-based conversation store: append-only node logs plus atomically
//! replaced branch files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::branch::BranchSet;
use crate::error::{EngineError, Result};
use crate::message::{BranchId, ConversationId, MessageId, MessageNode};
use crate::store::{ConversationMeta, ConversationStore, StoredConversation};

/// File-based conversation store.
///
/// Layout:
/// - `<base>/index.json`: array of `ConversationMeta`
/// - `<base>/<conversation>/messages.jsonl`: one finalized node per line
/// - `<base>/<conversation>/branches.json`: the branch set, replaced atomically
pub struct JsonlConversationStore {
    base: PathBuf,
    /// Serializes read-modify-write cycles on the index.
    index_lock: Mutex<()>,
}

impl JsonlConversationStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            index_lock: Mutex::new(()),
        }
    }

    /// Default store location: `~/.chatloop/conversations/`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("conversations")
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("index.json")
    }

    fn conversation_dir(&self, conversation: ConversationId) -> PathBuf {
        self.base.join(conversation.to_string())
    }

    fn messages_path(&self, conversation: ConversationId) -> PathBuf {
        self.conversation_dir(conversation).join("messages.jsonl")
    }

    fn branches_path(&self, conversation: ConversationId) -> PathBuf {
        self.conversation_dir(conversation).join("branches.json")
    }

    async fn load_index(&self) -> Result<Vec<ConversationMeta>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn save_index(&self, metas: &[ConversationMeta]) -> Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;
        let data = serde_json::to_string_pretty(metas)?;
        write_atomic(&self.index_path(), data.as_bytes()).await
    }

    async fn load_nodes(&self, conversation: ConversationId) -> Result<Vec<MessageNode>> {
        let path = self.messages_path(conversation);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut nodes = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let node: MessageNode = serde_json::from_str(line).map_err(|e| {
                EngineError::Store(format!(
                    "corrupt message log {} line {}: {e}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn load_branches(&self, conversation: ConversationId) -> Result<Option<BranchSet>> {
        let path = self.branches_path(conversation);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }
}

/// Write to a temp file, then rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn append_node(&self, conversation: ConversationId, node: &MessageNode) -> Result<()> {
        if node.is_streaming() {
            return Err(EngineError::Store(format!(
                "refusing to persist message {} while it is still streaming",
                node.id
            )));
        }
        tokio::fs::create_dir_all(self.conversation_dir(conversation)).await?;

        let line = serde_json::to_string(node)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.messages_path(conversation))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        debug!(conversation_id = %conversation, message_id = %node.id, seq = node.seq, "Appended message");
        Ok(())
    }

    async fn fetch_node(&self, conversation: ConversationId, id: MessageId) -> Result<Option<MessageNode>> {
        let nodes = self.load_nodes(conversation).await?;
        Ok(nodes.into_iter().find(|n| n.id == id))
    }

    async fn save_branches(&self, conversation: ConversationId, branches: &BranchSet) -> Result<()> {
        tokio::fs::create_dir_all(self.conversation_dir(conversation)).await?;
        let data = serde_json::to_string_pretty(branches)?;
        write_atomic(&self.branches_path(conversation), data.as_bytes()).await?;
        debug!(conversation_id = %conversation, branches = branches.len(), "Saved branches");
        Ok(())
    }

    async fn set_active_branch(&self, conversation: ConversationId, branch: BranchId) -> Result<()> {
        let mut branches = self
            .load_branches(conversation)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conversation {conversation}")))?;
        branches.set_active(branch)?;
        self.save_branches(conversation, &branches).await
    }

    async fn save_meta(&self, meta: &ConversationMeta) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut metas = self.load_index().await?;
        match metas.iter_mut().find(|m| m.id == meta.id) {
            Some(existing) => *existing = meta.clone(),
            None => metas.push(meta.clone()),
        }
        self.save_index(&metas).await
    }

    async fn load(&self, conversation: ConversationId) -> Result<Option<StoredConversation>> {
        let metas = self.load_index().await?;
        let Some(meta) = metas.into_iter().find(|m| m.id == conversation) else {
            return Ok(None);
        };
        let Some(branches) = self.load_branches(conversation).await? else {
            return Err(EngineError::Store(format!(
                "conversation {conversation} has no branch file"
            )));
        };
        let nodes = self.load_nodes(conversation).await?;
        debug!(conversation_id = %conversation, nodes = nodes.len(), "Loaded conversation");
        Ok(Some(StoredConversation {
            meta,
            nodes,
            branches,
        }))
    }

    async fn list(&self) -> Result<Vec<ConversationMeta>> {
        let mut metas = self.load_index().await?;
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(metas)
    }

    async fn delete(&self, conversation: ConversationId) -> Result<()> {
        {
            let _guard = self.index_lock.lock().await;
            let mut metas = self.load_index().await?;
            metas.retain(|m| m.id != conversation);
            self.save_index(&metas).await?;
        }

        let dir = self.conversation_dir(conversation);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        debug!(conversation_id = %conversation, "Deleted conversation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageContent, MessageStatus, Role};
    use crate::pool::MessagePool;
    use crate::role::AgentRole;
    use chrono::Utc;

    fn meta(id: ConversationId, count: usize) -> ConversationMeta {
        ConversationMeta {
            id,
            title: Some("list files".into()),
            role: AgentRole::Actor,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            message_count: count,
        }
    }

    fn two_nodes() -> (MessageNode, MessageNode) {
        let mut pool = MessagePool::new();
        let a = pool.create_node(Role::User, MessageContent::text("list files"), None).unwrap();
        let b = pool
            .create_marker(
                Role::Assistant,
                MessageContent::text("partial"),
                Some(a),
                MessageStatus::Failed { reason: "reset".into() },
            )
            .unwrap();
        (pool.get(a).unwrap().clone(), pool.get(b).unwrap().clone())
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlConversationStore::new(dir.path().to_path_buf());
        let conv = ConversationId::new();
        let (a, b) = two_nodes();

        let mut branches = BranchSet::new();
        branches.append_to_active(a.id);
        branches.append_to_active(b.id);

        store.append_node(conv, &a).await.unwrap();
        store.append_node(conv, &b).await.unwrap();
        store.save_branches(conv, &branches).await.unwrap();
        store.save_meta(&meta(conv, 2)).await.unwrap();

        let loaded = store.load(conv).await.unwrap().unwrap();
        assert_eq!(loaded.nodes, vec![a.clone(), b.clone()]);
        assert_eq!(loaded.branches, branches);
        assert_eq!(loaded.meta.message_count, 2);
        assert_eq!(store.fetch_node(conv, b.id).await.unwrap(), Some(b));
        assert!(dir.path().join(conv.to_string()).join("messages.jsonl").exists());
    }

    #[tokio::test]
    async fn test_set_active_branch_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlConversationStore::new(dir.path().to_path_buf());
        let conv = ConversationId::new();
        let (a, _) = two_nodes();

        let mut branches = BranchSet::new();
        branches.append_to_active(a.id);
        let fork = branches.fork(a.id).unwrap();
        store.save_branches(conv, &branches).await.unwrap();

        store.set_active_branch(conv, fork).await.unwrap();
        assert!(store.set_active_branch(conv, BranchId::new()).await.is_err());
        let reloaded = store.load_branches(conv).await.unwrap().unwrap();
        assert_eq!(reloaded.active_id(), fork);
        assert!(!dir.path().join(conv.to_string()).join("branches.tmp").exists());
    }

    #[tokio::test]
    async fn test_streaming_node_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlConversationStore::new(dir.path().to_path_buf());
        let mut pool = MessagePool::new();
        let id = pool.create_streaming_node(Role::Assistant, None).unwrap();
        let node = pool.get(id).unwrap().clone();
        assert!(store.append_node(ConversationId::new(), &node).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_line_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlConversationStore::new(dir.path().to_path_buf());
        let conv = ConversationId::new();
        store.save_branches(conv, &BranchSet::new()).await.unwrap();
        store.save_meta(&meta(conv, 0)).await.unwrap();
        tokio::fs::write(store.messages_path(conv), "not json\n").await.unwrap();

        let err = store.load(conv).await.unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlConversationStore::new(dir.path().to_path_buf());
        let first = ConversationId::new();
        let second = ConversationId::new();
        for id in [first, second] {
            store.save_branches(id, &BranchSet::new()).await.unwrap();
            store.save_meta(&meta(id, 0)).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 2);

        store.delete(first).await.unwrap();
        let remaining = store.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second);
        assert!(store.load(first).await.unwrap().is_none());
        assert!(!dir.path().join(first.to_string()).exists());
    }
}
