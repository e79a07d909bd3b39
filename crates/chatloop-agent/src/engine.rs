//! The engine: one serialization point per conversation.
//!
//! Each conversation lives behind its own `tokio::sync::Mutex`. Every mutating
//! operation takes the lock, applies one or more context events, persists the
//! resulting writes, publishes the outbox, and releases the lock. The loop
//! controller never holds the lock while waiting on the model, a tool, or an
//! approval, so snapshots stay cheap while a loop runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use chatloop_core::config::{Config, LoopBounds};
use chatloop_core::context::{ConversationContext, ConversationSnapshot, PendingWrites};
use chatloop_core::error::{EngineError, Result};
use chatloop_core::event::{ConversationEvent, EngineEvent};
use chatloop_core::message::{BranchId, ConversationId, MessageId, ToolCallId};
use chatloop_core::role::AgentRole;
use chatloop_core::state::ConversationState;
use chatloop_core::store::{ConversationMeta, ConversationStore, MemoryConversationStore};
use chatloop_providers::ModelTransport;
use chatloop_tools::ToolExecutor;

use crate::LoopReport;
use crate::approval::{ApprovalDecision, ApprovalSlot};

/// A loaded conversation plus its out-of-band coordination state.
pub(crate) struct ConversationHandle {
    pub(crate) context: Mutex<ConversationContext>,
    pub(crate) approvals: ApprovalSlot,
    run: std::sync::Mutex<Option<CancellationToken>>,
}

impl ConversationHandle {
    fn new(context: ConversationContext) -> Self {
        Self {
            context: Mutex::new(context),
            approvals: ApprovalSlot::new(),
            run: std::sync::Mutex::new(None),
        }
    }

    fn start_run(&self, token: CancellationToken) {
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    fn finish_run(&self) {
        self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn cancel_run(&self) -> bool {
        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        match run.as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Shared state behind every [`Engine`] clone.
pub(crate) struct EngineCore {
    pub(crate) transport: Arc<dyn ModelTransport>,
    pub(crate) tools: Arc<dyn ToolExecutor>,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) bounds: LoopBounds,
    pub(crate) role: AgentRole,
    pub(crate) system_prompt: Option<String>,
    pub(crate) workspace: Option<PathBuf>,
    events: Option<mpsc::UnboundedSender<ConversationEvent>>,
    conversations: RwLock<HashMap<ConversationId, Arc<ConversationHandle>>>,
}

impl EngineCore {
    /// Run `op` under the conversation lock, then persist and publish what it
    /// produced before releasing the lock.
    pub(crate) async fn with_context<T, F>(&self, handle: &ConversationHandle, op: F) -> Result<T>
    where
        F: FnOnce(&mut ConversationContext) -> Result<T> + Send,
        T: Send,
    {
        let mut context = handle.context.lock().await;
        let outcome = op(&mut context);
        self.flush(&mut context).await;
        outcome
    }

    async fn flush(&self, context: &mut ConversationContext) {
        let id = context.id();
        let mut writes = context.take_writes();
        let mut events = context.drain_events();

        if !writes.is_empty() {
            if let Err(e) = self.persist(context, &mut writes).await {
                error!(
                    conversation_id = %id,
                    error = %e,
                    unsaved_nodes = writes.nodes.len(),
                    "Failed to persist conversation"
                );
                context.requeue_writes(writes);
                events.push(EngineEvent::Errored {
                    message: format!("failed to persist conversation: {e}"),
                });
            }
        }

        if let Some(tx) = &self.events {
            for event in events {
                let _ = tx.send(ConversationEvent {
                    conversation_id: id,
                    event,
                });
            }
        }
    }

    /// Store `writes` in order, removing each part once the store accepts it.
    /// On error, `writes` holds exactly what is still unsaved. Branches are
    /// only saved after every node they may reference.
    async fn persist(&self, context: &ConversationContext, writes: &mut PendingWrites) -> Result<()> {
        let id = context.id();
        while let Some(node) = writes.nodes.first() {
            self.store.append_node(id, node).await?;
            writes.nodes.remove(0);
        }
        if let Some(branches) = &writes.branches {
            self.store.save_branches(id, branches).await?;
            writes.branches = None;
        }
        self.store.save_meta(&meta_for(context)).await
    }
}

fn meta_for(context: &ConversationContext) -> ConversationMeta {
    ConversationMeta {
        id: context.id(),
        title: context.title(),
        role: context.role(),
        created_at: context.created_at(),
        updated_at: Utc::now(),
        message_count: context.pool().len(),
    }
}

pub struct EngineBuilder {
    transport: Arc<dyn ModelTransport>,
    tools: Arc<dyn ToolExecutor>,
    store: Arc<dyn ConversationStore>,
    bounds: LoopBounds,
    role: AgentRole,
    system_prompt: Option<String>,
    workspace: Option<PathBuf>,
    events: Option<mpsc::UnboundedSender<ConversationEvent>>,
}

impl EngineBuilder {
    /// Bounds, default role, persona and workspace from config.
    pub fn config(mut self, config: &Config) -> Self {
        self.bounds = LoopBounds::from(config);
        self.role = config.role();
        self.system_prompt = config.system_prompt().map(str::to_string);
        self.workspace = Some(config.workspace_dir());
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn bounds(mut self, bounds: LoopBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Every conversation's events are sent here.
    pub fn events(mut self, tx: mpsc::UnboundedSender<ConversationEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            core: Arc::new(EngineCore {
                transport: self.transport,
                tools: self.tools,
                store: self.store,
                bounds: self.bounds,
                role: self.role,
                system_prompt: self.system_prompt,
                workspace: self.workspace,
                events: self.events,
                conversations: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Conversation engine. Cheap to clone; clones share all conversations.
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Start building an engine. The store defaults to an in-memory one.
    pub fn builder(transport: Arc<dyn ModelTransport>, tools: Arc<dyn ToolExecutor>) -> EngineBuilder {
        EngineBuilder {
            transport,
            tools,
            store: Arc::new(MemoryConversationStore::new()),
            bounds: LoopBounds::default(),
            role: AgentRole::default(),
            system_prompt: None,
            workspace: None,
            events: None,
        }
    }

    /// Create an empty conversation with the engine's default role.
    pub async fn create(&self) -> Result<ConversationId> {
        self.create_with_role(self.core.role).await
    }

    pub async fn create_with_role(&self, role: AgentRole) -> Result<ConversationId> {
        let context = ConversationContext::new(role, self.core.bounds);
        let id = context.id();
        let handle = Arc::new(ConversationHandle::new(context));
        self.core.with_context(&handle, |_| Ok(())).await?;
        self.core.conversations.write().await.insert(id, handle);
        info!(conversation_id = %id, %role, "Created conversation");
        Ok(id)
    }

    /// Load a stored conversation into memory. A no-op if already loaded.
    pub async fn open(&self, id: ConversationId) -> Result<ConversationSnapshot> {
        let handle = self.handle(id).await?;
        let context = handle.context.lock().await;
        Ok(context.snapshot())
    }

    async fn handle(&self, id: ConversationId) -> Result<Arc<ConversationHandle>> {
        if let Some(handle) = self.core.conversations.read().await.get(&id) {
            return Ok(handle.clone());
        }

        let stored = self
            .core
            .store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("conversation {id}")))?;
        let context = ConversationContext::restore(
            id,
            stored.meta.created_at,
            stored.nodes,
            stored.branches,
            stored.meta.role,
            self.core.bounds,
        )?;
        debug!(conversation_id = %id, messages = context.pool().len(), "Restored conversation");

        let mut conversations = self.core.conversations.write().await;
        let handle = conversations
            .entry(id)
            .or_insert_with(|| Arc::new(ConversationHandle::new(context)));
        Ok(handle.clone())
    }

    /// Submit a user message and drive the agent loop until it terminates.
    ///
    /// Bounded terminations (limits, protocol violation, rejection,
    /// cancellation) come back as an `Ok` report; see [`LoopReport::into_result`].
    /// Transport failures leave the conversation `Errored` and return `Err`;
    /// the next message recovers it.
    pub async fn send_message(&self, id: ConversationId, text: impl Into<String>) -> Result<LoopReport> {
        let handle = self.handle(id).await?;
        let text = text.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        self.core
            .with_context(&handle, |context| {
                if context.state() == ConversationState::Errored {
                    context.recover();
                }
                context.submit_user_message(text)?;
                handle.start_run(token);
                Ok(())
            })
            .await?;

        let report = self.core.run_loop(&handle, cancel).await;
        handle.finish_run();
        report
    }

    pub async fn approve(&self, id: ConversationId, call_id: ToolCallId) -> Result<bool> {
        let handle = self.handle(id).await?;
        Ok(handle.approvals.resolve(call_id, ApprovalDecision::Approve))
    }

    pub async fn reject(&self, id: ConversationId, call_id: ToolCallId) -> Result<bool> {
        let handle = self.handle(id).await?;
        Ok(handle.approvals.resolve(call_id, ApprovalDecision::Reject))
    }

    /// Cancel the running loop. Returns false when nothing is running.
    pub async fn cancel(&self, id: ConversationId) -> Result<bool> {
        let handle = self.handle(id).await?;
        let cancelled = handle.cancel_run();
        if cancelled {
            info!(conversation_id = %id, "Cancellation requested");
        }
        Ok(cancelled)
    }

    pub async fn snapshot(&self, id: ConversationId) -> Result<ConversationSnapshot> {
        let handle = self.handle(id).await?;
        let context = handle.context.lock().await;
        Ok(context.snapshot())
    }

    pub async fn state(&self, id: ConversationId) -> Result<ConversationState> {
        let handle = self.handle(id).await?;
        let context = handle.context.lock().await;
        Ok(context.state())
    }

    /// Fork the active branch at `from` (inclusive). The new branch is not activated.
    pub async fn fork_branch(&self, id: ConversationId, from: MessageId) -> Result<BranchId> {
        let handle = self.handle(id).await?;
        self.core.with_context(&handle, |context| context.fork_branch(from)).await
    }

    pub async fn set_active_branch(&self, id: ConversationId, branch: BranchId) -> Result<()> {
        let handle = self.handle(id).await?;
        self.core
            .with_context(&handle, |context| context.set_active_branch(branch))
            .await
    }

    pub async fn set_role(&self, id: ConversationId, role: AgentRole) -> Result<()> {
        let handle = self.handle(id).await?;
        let mut context = handle.context.lock().await;
        context.set_role(role)?;
        self.core.store.save_meta(&meta_for(&context)).await
    }

    /// Stored conversations, most recently updated first.
    pub async fn list(&self) -> Result<Vec<ConversationMeta>> {
        self.core.store.list().await
    }

    /// Remove a conversation from memory and storage. Refused while a loop runs.
    pub async fn delete(&self, id: ConversationId) -> Result<()> {
        let mut conversations = self.core.conversations.write().await;
        if let Some(handle) = conversations.get(&id) {
            let state = handle.context.lock().await.state();
            if state.is_busy() {
                return Err(EngineError::Busy(state));
            }
            conversations.remove(&id);
        }
        drop(conversations);
        self.core.store.delete(id).await?;
        info!(conversation_id = %id, "Deleted conversation");
        Ok(())
    }
}
