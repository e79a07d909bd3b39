//! Conversation context: the aggregate root and its state machine.
//!
//! Every mutation goes through one of the event methods below. An event that
//! arrives in a state that does not accept it is dropped with a diagnostic and
//! leaves the context untouched, so late or duplicated network events are
//! harmless. Side effects for the outside world are queued in an outbox
//! ([`ConversationContext::drain_events`]) together with the nodes and branch
//! changes still waiting to be persisted ([`ConversationContext::take_writes`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assembler::{BufferHandle, DeltaOutcome, StreamAssembler, StreamBuffer};
use crate::branch::{Branch, BranchSet};
use crate::config::LoopBounds;
use crate::error::{EngineError, Result};
use crate::event::{EngineEvent, TerminationReason};
use crate::message::{
    BranchId, ConversationId, MessageContent, MessageId, MessageNode, MessageStatus, Role,
    ToolCallId, ToolInvocation, ToolResult,
};
use crate::pool::MessagePool;
use crate::protocol::{self, ParseOutcome};
use crate::role::{self, AgentRole, CapabilityRegistry, Gate};
use crate::state::ConversationState;

/// An invocation parked until the caller approves or rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub invocation: ToolInvocation,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn call_id(&self) -> ToolCallId {
        self.invocation.id
    }
}

/// What the loop controller must do after `finish_streaming`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStep {
    /// Plain text, plan, or question. The context is `Idle`.
    Done(MessageId),
    /// Run the tool now. The context is `ExecutingTool`.
    Execute(ToolInvocation),
    /// Wait for `approve`/`reject`. The context is `AwaitingToolApproval`.
    AwaitApproval(ToolInvocation),
    /// Gating refused the tool; a failure result is already appended.
    Denied {
        invocation: ToolInvocation,
        result: ToolResult,
    },
    /// The output attempted a tool call and got it wrong. The context is `AwaitingModel`.
    Malformed { reason: String },
    /// The context was not streaming.
    Ignored,
}

/// Nodes and branch state not yet handed to a store.
#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    pub nodes: Vec<MessageNode>,
    pub branches: Option<BranchSet>,
}

impl PendingWrites {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.branches.is_none()
    }
}

/// Read-only view of a conversation for callers polling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub state: ConversationState,
    pub role: AgentRole,
    pub active_branch: BranchId,
    pub branches: Vec<Branch>,
    /// Finalized nodes on the active branch, in order.
    pub messages: Vec<MessageNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamBuffer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct ConversationContext {
    id: ConversationId,
    created_at: DateTime<Utc>,
    pool: MessagePool,
    branches: BranchSet,
    state: ConversationState,
    assembler: StreamAssembler,
    pending: Option<PendingApproval>,
    executing: Option<ToolInvocation>,
    role: AgentRole,
    bounds: LoopBounds,
    last_error: Option<String>,
    outbox: Vec<EngineEvent>,
    unsaved: Vec<MessageId>,
    branches_dirty: bool,
}

impl ConversationContext {
    pub fn new(role: AgentRole, bounds: LoopBounds) -> Self {
        Self::with_id(ConversationId::new(), role, bounds)
    }

    pub fn with_id(id: ConversationId, role: AgentRole, bounds: LoopBounds) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            pool: MessagePool::new(),
            branches: BranchSet::new(),
            state: ConversationState::Idle,
            assembler: StreamAssembler::new(),
            pending: None,
            executing: None,
            role,
            bounds,
            last_error: None,
            outbox: Vec::new(),
            unsaved: Vec::new(),
            branches_dirty: true,
        }
    }

    /// Rebuild a context from stored nodes and branches. The result is `Idle`.
    pub fn restore(
        id: ConversationId,
        created_at: DateTime<Utc>,
        mut nodes: Vec<MessageNode>,
        branches: BranchSet,
        role: AgentRole,
        bounds: LoopBounds,
    ) -> Result<Self> {
        nodes.sort_by_key(|n| n.seq);
        let mut pool = MessagePool::new();
        for node in nodes {
            if node.is_streaming() {
                warn!(conversation_id = %id, message_id = %node.id, "Skipping stored node still marked streaming");
                continue;
            }
            pool.restore(node);
        }

        for branch in branches.iter() {
            if let Some(missing) = branch.refs().iter().find(|m| !pool.contains(**m)) {
                return Err(EngineError::Store(format!(
                    "branch '{}' references missing message {missing}",
                    branch.name
                )));
            }
        }

        Ok(Self {
            id,
            created_at,
            pool,
            branches,
            state: ConversationState::Idle,
            assembler: StreamAssembler::new(),
            pending: None,
            executing: None,
            role,
            bounds,
            last_error: None,
            outbox: Vec::new(),
            unsaved: Vec::new(),
            branches_dirty: false,
        })
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn bounds(&self) -> LoopBounds {
        self.bounds
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    pub fn branches(&self) -> &BranchSet {
        &self.branches
    }

    pub fn pending_approval(&self) -> Option<&PendingApproval> {
        self.pending.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Finalized nodes of the active branch, oldest first.
    pub fn messages(&self) -> Vec<&MessageNode> {
        self.branches
            .active()
            .refs()
            .iter()
            .filter_map(|id| self.pool.get(*id).ok())
            .collect()
    }

    /// First user message, shortened, for listings.
    pub fn title(&self) -> Option<String> {
        self.messages()
            .into_iter()
            .find(|n| n.role == Role::User)
            .and_then(|n| n.content.as_text())
            .map(|text| {
                let line = text.lines().next().unwrap_or_default();
                if line.chars().count() > 60 {
                    format!("{}...", line.chars().take(57).collect::<String>())
                } else {
                    line.to_string()
                }
            })
    }

    // --- state machine events ---

    /// `Idle → AwaitingModel`; appends the user message to the active branch.
    pub fn submit_user_message(&mut self, text: impl Into<String>) -> Result<MessageId> {
        if self.state != ConversationState::Idle {
            return Err(EngineError::Busy(self.state));
        }
        let id = self.append(Role::User, MessageContent::text(text), MessageStatus::Complete)?;
        self.transition(ConversationState::AwaitingModel);
        Ok(id)
    }

    /// `AwaitingModel → StreamingResponse`; opens the streaming buffer at seq 0.
    pub fn begin_streaming(&mut self) -> Result<Option<BufferHandle>> {
        if self.state != ConversationState::AwaitingModel {
            self.ignore("begin_streaming");
            return Ok(None);
        }
        if let Some(open) = self.assembler.open_handle() {
            return Err(EngineError::StreamAlreadyOpen(open.message_id.to_string()));
        }

        let parent = self.branches.active().last();
        let message_id = self.pool.create_streaming_node(Role::Assistant, parent)?;
        let handle = self.assembler.open(message_id)?;
        self.transition(ConversationState::StreamingResponse);
        Ok(Some(handle))
    }

    /// Apply delta `seq`. Duplicates are no-ops; a gap fails with
    /// `OutOfOrderDelta` and leaves the buffer unchanged.
    pub fn apply_delta(&mut self, seq: u64, text: &str) -> Result<DeltaOutcome> {
        let Some(handle) = self.streaming_handle() else {
            self.ignore("apply_delta");
            return Ok(DeltaOutcome::Ignored);
        };

        let outcome = self.assembler.append(handle, seq, text)?;
        if outcome == DeltaOutcome::Applied {
            self.pool.append_streaming_text(handle.message_id, text)?;
            self.outbox.push(EngineEvent::StreamingDelta {
                message_id: handle.message_id,
                text: text.to_string(),
            });
        }
        Ok(outcome)
    }

    /// Seal the streamed response and decide what happens next.
    pub fn finish_streaming(&mut self, registry: &dyn CapabilityRegistry) -> Result<StreamStep> {
        let Some(handle) = self.streaming_handle() else {
            self.ignore("finish_streaming");
            return Ok(StreamStep::Ignored);
        };
        let Some(raw) = self.assembler.finalize(handle)? else {
            return Ok(StreamStep::Ignored);
        };
        let message_id = handle.message_id;

        match protocol::parse(&raw) {
            ParseOutcome::PlainText(text) => {
                let content =
                    protocol::structured_content(&text).unwrap_or(MessageContent::Text { text });
                self.seal(message_id, content, MessageStatus::Complete)?;
                self.transition(ConversationState::Idle);
                Ok(StreamStep::Done(message_id))
            }
            ParseOutcome::Invocation(invocation) => {
                let content = MessageContent::Invocation {
                    invocations: vec![invocation.clone()],
                };
                self.seal(message_id, content, MessageStatus::Complete)?;
                self.route_invocation(registry, invocation)
            }
            ParseOutcome::MalformedInvocation(reason) => {
                debug!(conversation_id = %self.id, %reason, "Malformed tool invocation");
                let status = MessageStatus::Failed {
                    reason: format!("malformed tool invocation: {reason}"),
                };
                self.seal(message_id, MessageContent::Text { text: raw }, status)?;
                self.transition(ConversationState::AwaitingModel);
                Ok(StreamStep::Malformed { reason })
            }
        }
    }

    fn route_invocation(
        &mut self,
        registry: &dyn CapabilityRegistry,
        invocation: ToolInvocation,
    ) -> Result<StreamStep> {
        match role::gate(registry, self.role, &invocation.tool) {
            Gate::Auto => {
                self.executing = Some(invocation.clone());
                self.transition(ConversationState::ExecutingTool);
                Ok(StreamStep::Execute(invocation))
            }
            Gate::Approval => {
                debug!(conversation_id = %self.id, tool = %invocation.tool, call_id = %invocation.id, "Awaiting tool approval");
                self.outbox.push(EngineEvent::ApprovalRequested {
                    call_id: invocation.id,
                    tool: invocation.tool.clone(),
                    params: invocation.params.clone(),
                });
                self.pending = Some(PendingApproval {
                    invocation: invocation.clone(),
                    requested_at: Utc::now(),
                });
                self.transition(ConversationState::AwaitingToolApproval);
                Ok(StreamStep::AwaitApproval(invocation))
            }
            Gate::Denied(reason) => {
                warn!(conversation_id = %self.id, tool = %invocation.tool, role = %self.role, %reason, "Tool call denied");
                self.executing = Some(invocation.clone());
                self.transition(ConversationState::ExecutingTool);
                let output = protocol::tool_failure_feedback(&invocation.tool, &reason);
                let result = ToolResult::failure(&invocation, output);
                self.tool_execution_complete(result.clone())?;
                Ok(StreamStep::Denied { invocation, result })
            }
        }
    }

    /// Transport or tool failure. Preserves partial output as a failed node.
    pub fn handle_model_error(&mut self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        if !self.state.accepts_model_error() {
            self.ignore("handle_model_error");
            return Ok(());
        }

        let status = MessageStatus::Failed {
            reason: message.clone(),
        };
        if let Some(handle) = self.assembler.open_handle() {
            let partial = self.assembler.finalize(handle)?.unwrap_or_default();
            self.seal(handle.message_id, MessageContent::text(partial), status)?;
        } else if let Some(invocation) = self.executing.take() {
            let result = ToolResult::failure(&invocation, message.clone());
            self.append(Role::System, MessageContent::ToolResult { result }, status)?;
        } else {
            let text = format!("Model request failed: {message}");
            self.append(Role::System, MessageContent::text(text), status)?;
        }

        warn!(conversation_id = %self.id, state = %self.state, error = %message, "Conversation errored");
        self.last_error = Some(message.clone());
        self.outbox.push(EngineEvent::Errored { message });
        self.transition(ConversationState::Errored);
        Ok(())
    }

    /// `Errored → Idle`. Returns false if the context was not errored.
    pub fn recover(&mut self) -> bool {
        if self.state != ConversationState::Errored {
            return false;
        }
        self.last_error = None;
        self.transition(ConversationState::Idle);
        true
    }

    /// `AwaitingToolApproval → ExecutingTool` for the matching call.
    pub fn approve(&mut self, call_id: ToolCallId) -> Option<ToolInvocation> {
        let pending = self.take_pending(call_id, "approve")?;
        let invocation = pending.invocation;
        info!(conversation_id = %self.id, tool = %invocation.tool, %call_id, "Tool call approved");
        self.executing = Some(invocation.clone());
        self.transition(ConversationState::ExecutingTool);
        Some(invocation)
    }

    /// `AwaitingToolApproval → Idle`, appending exactly one rejection result.
    pub fn reject(&mut self, call_id: ToolCallId) -> Result<Option<MessageId>> {
        let Some(pending) = self.take_pending(call_id, "reject") else {
            return Ok(None);
        };
        info!(conversation_id = %self.id, tool = %pending.invocation.tool, %call_id, "Tool call rejected");
        let result = ToolResult::rejected(&pending.invocation);
        let id = self.append(
            Role::System,
            MessageContent::ToolResult { result },
            MessageStatus::Complete,
        )?;
        self.transition(ConversationState::Idle);
        Ok(Some(id))
    }

    /// `ExecutingTool → AwaitingModel | Idle` depending on the invocation's
    /// continuation flag. Appends the result node first.
    pub fn tool_execution_complete(&mut self, result: ToolResult) -> Result<Option<ConversationState>> {
        if self.state != ConversationState::ExecutingTool {
            self.ignore("tool_execution_complete");
            return Ok(None);
        }
        let matches_call = self
            .executing
            .as_ref()
            .is_some_and(|inv| inv.id == result.call_id);
        if !matches_call {
            debug!(conversation_id = %self.id, call_id = %result.call_id, "Ignoring result for unknown tool call");
            return Ok(None);
        }
        let Some(invocation) = self.executing.take() else {
            return Ok(None);
        };

        self.append(
            Role::System,
            MessageContent::ToolResult { result },
            MessageStatus::Complete,
        )?;
        let next = if invocation.continue_loop {
            ConversationState::AwaitingModel
        } else {
            ConversationState::Idle
        };
        self.transition(next);
        Ok(Some(next))
    }

    /// Append the corrective instruction after a malformed response.
    pub fn append_corrective(&mut self, reason: &str) -> Result<Option<MessageId>> {
        if self.state != ConversationState::AwaitingModel {
            self.ignore("append_corrective");
            return Ok(None);
        }
        let text = protocol::corrective_instruction(reason);
        self.append(Role::User, MessageContent::text(text), MessageStatus::Complete)
            .map(Some)
    }

    /// Force-terminate the running loop: seal whatever is in flight as
    /// aborted, append a marker explaining why, and return to `Idle`.
    /// Returns false when no loop was running.
    pub fn abort_loop(&mut self, reason: TerminationReason) -> Result<bool> {
        let text = reason.marker_text();
        let status = MessageStatus::Aborted {
            reason: text.clone(),
        };

        match self.state {
            ConversationState::Idle | ConversationState::Errored => {
                self.ignore("abort_loop");
                return Ok(false);
            }
            ConversationState::StreamingResponse => {
                if let Some(handle) = self.assembler.open_handle() {
                    let partial = self.assembler.finalize(handle)?.unwrap_or_default();
                    self.seal(handle.message_id, MessageContent::text(partial), status)?;
                }
            }
            ConversationState::AwaitingToolApproval => {
                if let Some(pending) = self.pending.take() {
                    let result = ToolResult::aborted(&pending.invocation, text);
                    self.append(Role::System, MessageContent::ToolResult { result }, status)?;
                }
            }
            ConversationState::ExecutingTool => {
                if let Some(invocation) = self.executing.take() {
                    let result = ToolResult::aborted(&invocation, text);
                    self.append(Role::System, MessageContent::ToolResult { result }, status)?;
                }
            }
            ConversationState::AwaitingModel => {
                self.append(Role::System, MessageContent::text(text), status)?;
            }
        }

        info!(conversation_id = %self.id, reason = ?reason, "Agent loop aborted");
        self.transition(ConversationState::Idle);
        self.outbox.push(EngineEvent::LoopTerminated { reason });
        Ok(true)
    }

    /// Cancel whatever is in flight.
    pub fn cancel(&mut self) -> Result<bool> {
        self.abort_loop(TerminationReason::Cancelled)
    }

    /// Report a loop that already ended through a regular transition.
    pub fn loop_terminated(&mut self, reason: TerminationReason) {
        self.outbox.push(EngineEvent::LoopTerminated { reason });
    }

    // --- branches and configuration ---

    pub fn fork_branch(&mut self, from: MessageId) -> Result<BranchId> {
        let id = self.branches.fork(from)?;
        self.branches_dirty = true;
        debug!(conversation_id = %self.id, branch_id = %id, %from, "Forked branch");
        Ok(id)
    }

    /// Switch the active branch. Refused while a loop is running.
    pub fn set_active_branch(&mut self, id: BranchId) -> Result<()> {
        if self.state.is_busy() {
            return Err(EngineError::Busy(self.state));
        }
        self.branches.set_active(id)?;
        self.branches_dirty = true;
        Ok(())
    }

    /// Change the capability role. Only allowed while `Idle`.
    pub fn set_role(&mut self, role: AgentRole) -> Result<()> {
        if self.state != ConversationState::Idle {
            return Err(EngineError::Busy(self.state));
        }
        self.role = role;
        Ok(())
    }

    pub fn set_bounds(&mut self, bounds: LoopBounds) {
        self.bounds = bounds;
    }

    // --- outbox ---

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Finalized nodes and branch changes accumulated since the last call.
    pub fn take_writes(&mut self) -> PendingWrites {
        let nodes = std::mem::take(&mut self.unsaved)
            .into_iter()
            .filter_map(|id| self.pool.get(id).ok().cloned())
            .collect();
        let branches = if std::mem::take(&mut self.branches_dirty) {
            Some(self.branches.clone())
        } else {
            None
        };
        PendingWrites { nodes, branches }
    }

    /// Hand back writes the store did not accept. They go out ahead of
    /// anything finalized since, on the next `take_writes`.
    pub fn requeue_writes(&mut self, writes: PendingWrites) {
        if writes.is_empty() {
            return;
        }
        debug!(
            conversation_id = %self.id,
            nodes = writes.nodes.len(),
            branches = writes.branches.is_some(),
            "Requeued unsaved writes"
        );
        let mut unsaved: Vec<MessageId> = writes.nodes.iter().map(|n| n.id).collect();
        unsaved.append(&mut self.unsaved);
        self.unsaved = unsaved;
        if writes.branches.is_some() {
            self.branches_dirty = true;
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id,
            state: self.state,
            role: self.role,
            active_branch: self.branches.active_id(),
            branches: self.branches.iter().cloned().collect(),
            messages: self.messages().into_iter().cloned().collect(),
            streaming: self.assembler.current().filter(|b| !b.finalized).cloned(),
            pending_approval: self.pending.clone(),
            last_error: self.last_error.clone(),
        }
    }

    // --- internals ---

    fn transition(&mut self, to: ConversationState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(conversation_id = %self.id, %from, %to, "State transition");
        self.state = to;
        self.outbox.push(EngineEvent::StateChanged { from, to });
    }

    fn ignore(&self, event: &str) {
        debug!(conversation_id = %self.id, state = %self.state, event, "Ignoring event invalid for current state");
    }

    fn streaming_handle(&self) -> Option<BufferHandle> {
        if self.state != ConversationState::StreamingResponse {
            return None;
        }
        self.assembler.open_handle()
    }

    fn take_pending(&mut self, call_id: ToolCallId, event: &str) -> Option<PendingApproval> {
        if self.state != ConversationState::AwaitingToolApproval {
            self.ignore(event);
            return None;
        }
        match &self.pending {
            Some(pending) if pending.call_id() == call_id => self.pending.take(),
            _ => {
                debug!(conversation_id = %self.id, %call_id, event, "No pending approval with this call id");
                None
            }
        }
    }

    /// Create a finalized node as the new tip of the active branch.
    fn append(&mut self, role: Role, content: MessageContent, status: MessageStatus) -> Result<MessageId> {
        let parent = self.branches.active().last();
        let id = self.pool.create_marker(role, content, parent, status)?;
        self.commit(id)
    }

    /// Seal a streaming node and put it on the active branch.
    fn seal(&mut self, id: MessageId, content: MessageContent, status: MessageStatus) -> Result<()> {
        self.pool.finalize(id, content, status)?;
        self.commit(id)?;
        Ok(())
    }

    fn commit(&mut self, id: MessageId) -> Result<MessageId> {
        let node = self.pool.get(id)?.clone();
        self.branches.append_to_active(id);
        self.branches_dirty = true;
        self.unsaved.push(id);
        self.outbox.push(EngineEvent::MessageAppended { node });
        Ok(id)
    }
}
