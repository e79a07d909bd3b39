//! Engine operations around a running loop: approvals, cancellation,
//! roles, branches, and persistence.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use chatloop_core::branch::BranchSet;
use chatloop_core::config::LoopBounds;
use chatloop_core::error::EngineError;
use chatloop_core::event::{EngineEvent, TerminationReason};
use chatloop_core::message::{
    BranchId, ConversationId, MessageContent, MessageId, MessageNode, MessageStatus, ToolOutcome,
};
use chatloop_core::role::AgentRole;
use chatloop_core::state::ConversationState;
use chatloop_core::store::{ConversationMeta, ConversationStore, MemoryConversationStore, StoredConversation};
use chatloop_core::store_jsonl::JsonlConversationStore;
use chatloop_providers::{ScriptedTransport, ScriptedTurn};

use common::{Behavior, RecordingTool, call, drain, harness, harness_with_store, registry, wait_for};

fn approval_call(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::ApprovalRequested { .. })
}

#[tokio::test]
async fn test_rejection_aborts_loop_without_executing() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = registry(dir.path());
    let (deploy, calls) = RecordingTool::new("deploy", Behavior::Reply("shipped".into()));
    tools.register(Box::new(deploy.gated()));

    let transport = ScriptedTransport::new([call("deploy", json!({"env": "prod"}), true)])
        .with_fallback(ScriptedTurn::text("should never be requested"));
    let mut h = harness(transport, tools, LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.send_message(id, "ship it").await });

    let EngineEvent::ApprovalRequested { call_id, tool, params } = wait_for(&mut h.events, approval_call).await
    else {
        unreachable!()
    };
    assert_eq!(tool, "deploy");
    assert_eq!(params["env"], "prod");
    assert_eq!(
        h.engine.state(id).await.unwrap(),
        ConversationState::AwaitingToolApproval
    );

    assert!(h.engine.reject(id, call_id).await.unwrap());
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.reason, TerminationReason::Rejected { call_id });
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.requests().await.len(), 1);

    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.state, ConversationState::Idle);
    assert!(snapshot.pending_approval.is_none());
    let rejections: Vec<_> = snapshot
        .messages
        .iter()
        .filter_map(|m| m.tool_result())
        .filter(|r| r.outcome == ToolOutcome::Rejected)
        .collect();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].call_id, call_id);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::LoopTerminated { reason: TerminationReason::Rejected { .. } }
    )));
}

#[tokio::test]
async fn test_approval_runs_tool_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = registry(dir.path());
    let (deploy, calls) = RecordingTool::new("deploy", Behavior::Reply("shipped v2".into()));
    tools.register(Box::new(deploy.gated()));

    let transport = ScriptedTransport::new([
        call("deploy", json!({}), true),
        ScriptedTurn::text("Deployed."),
    ]);
    let mut h = harness(transport, tools, LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.send_message(id, "ship it").await });

    let EngineEvent::ApprovalRequested { call_id, .. } = wait_for(&mut h.events, approval_call).await else {
        unreachable!()
    };
    assert!(!h.engine.approve(id, chatloop_core::message::ToolCallId::new()).await.unwrap());
    assert!(h.engine.approve(id, call_id).await.unwrap());

    let report = run.await.unwrap().unwrap();
    assert!(report.is_normal());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let snapshot = h.engine.snapshot(id).await.unwrap();
    let result = snapshot.messages[2].tool_result().unwrap();
    assert_eq!(result.outcome, ToolOutcome::Success);
    assert_eq!(result.output, "shipped v2");
    assert_eq!(snapshot.messages[3].content, MessageContent::text("Deployed."));
}

#[tokio::test]
async fn test_planner_cannot_run_mutating_tools() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new([
        call("write_file", json!({"path": "x.txt", "content": "hi"}), true),
        ScriptedTurn::text("I can only plan."),
    ]);
    let mut h = harness(transport, registry(dir.path()), LoopBounds::default());
    let id = h.engine.create_with_role(AgentRole::Planner).await.unwrap();

    let report = h.engine.send_message(id, "write x.txt").await.unwrap();
    assert!(report.is_normal());
    assert!(!dir.path().join("x.txt").exists());

    let snapshot = h.engine.snapshot(id).await.unwrap();
    let result = snapshot.messages[2].tool_result().unwrap();
    assert_eq!(result.outcome, ToolOutcome::Failure);
    assert!(result.output.contains("planner role"));
    assert!(!drain(&mut h.events).iter().any(approval_call));

    let system = h.transport.requests().await[0].system.clone().unwrap();
    assert!(!system.contains("write_file"));
    assert!(system.contains("read_file"));
}

#[tokio::test]
async fn test_planner_auto_runs_gated_read_only_tool() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = registry(dir.path());
    let (audit, calls) = RecordingTool::new("audit", Behavior::Reply("clean".into()));
    tools.register(Box::new(audit.read_only().gated()));

    let transport = ScriptedTransport::new([call("audit", json!({}), false)]);
    let h = harness(transport, tools, LoopBounds::default());
    let id = h.engine.create_with_role(AgentRole::Planner).await.unwrap();

    let report = h.engine.send_message(id, "audit").await.unwrap();
    assert!(report.is_normal());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_while_streaming_seals_partial() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new([ScriptedTurn::Hang]);
    let mut h = harness(transport, registry(dir.path()), LoopBounds::default());
    let id = h.engine.create().await.unwrap();
    assert!(!h.engine.cancel(id).await.unwrap());

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.send_message(id, "hello?").await });

    wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::StateChanged { to: ConversationState::StreamingResponse, .. })
    })
    .await;

    let busy = h.engine.send_message(id, "again").await.unwrap_err();
    assert!(matches!(busy, EngineError::Busy(ConversationState::StreamingResponse)));
    assert!(matches!(
        h.engine.set_role(id, AgentRole::Planner).await,
        Err(EngineError::Busy(_))
    ));

    assert!(h.engine.cancel(id).await.unwrap());
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.reason, TerminationReason::Cancelled);

    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.state, ConversationState::Idle);
    assert!(snapshot.streaming.is_none());
    let sealed = snapshot.messages.last().unwrap();
    assert!(matches!(sealed.status, MessageStatus::Aborted { .. }));
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = registry(dir.path());
    let (deploy, calls) = RecordingTool::new("deploy", Behavior::Reply("shipped".into()));
    tools.register(Box::new(deploy.gated()));

    let transport = ScriptedTransport::new([call("deploy", json!({}), true)]);
    let mut h = harness(transport, tools, LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.send_message(id, "ship it").await });
    let EngineEvent::ApprovalRequested { call_id, .. } = wait_for(&mut h.events, approval_call).await else {
        unreachable!()
    };

    assert!(h.engine.cancel(id).await.unwrap());
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.reason, TerminationReason::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A late approval is a no-op.
    assert!(!h.engine.approve(id, call_id).await.unwrap());

    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.state, ConversationState::Idle);
    assert!(snapshot.pending_approval.is_none());
    let result = snapshot.messages.last().unwrap().tool_result().unwrap();
    assert_eq!(result.outcome, ToolOutcome::Aborted);
}

#[tokio::test]
async fn test_fork_and_switch_branches() {
    let dir = tempfile::tempdir().unwrap();
    let transport = ScriptedTransport::new([
        ScriptedTurn::text("first answer"),
        ScriptedTurn::text("second answer"),
        ScriptedTurn::text("retried answer"),
    ]);
    let h = harness(transport, registry(dir.path()), LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    h.engine.send_message(id, "one").await.unwrap();
    let after_first = h.engine.snapshot(id).await.unwrap();
    let fork_point = after_first.messages[1].id;
    let main = after_first.active_branch;

    h.engine.send_message(id, "two").await.unwrap();
    let main_refs: Vec<_> = h.engine.snapshot(id).await.unwrap().messages.iter().map(|m| m.id).collect();
    assert_eq!(main_refs.len(), 4);

    let fork = h.engine.fork_branch(id, fork_point).await.unwrap();
    h.engine.set_active_branch(id, fork).await.unwrap();
    h.engine.send_message(id, "two, rephrased").await.unwrap();

    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.active_branch, fork);
    let fork_refs: Vec<_> = snapshot.messages.iter().map(|m| m.id).collect();
    assert_eq!(fork_refs[..2], main_refs[..2]);
    assert_ne!(fork_refs[2], main_refs[2]);
    assert_eq!(snapshot.messages[3].content, MessageContent::text("retried answer"));

    let main_branch = snapshot.branches.iter().find(|b| b.id == main).unwrap();
    assert_eq!(main_branch.refs(), &main_refs[..]);

    let missing = h.engine.set_active_branch(id, BranchId::new()).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_conversation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ConversationStore> = Arc::new(JsonlConversationStore::new(store_dir.path().to_path_buf()));

    let transport = ScriptedTransport::new([
        call("list_directory", json!({"path": "."}), true),
        ScriptedTurn::text("Nothing here."),
    ]);
    let h = harness_with_store(transport, registry(dir.path()), LoopBounds::default(), Some(store.clone()));
    let id = h.engine.create().await.unwrap();
    h.engine.send_message(id, "list files").await.unwrap();
    let before = h.engine.snapshot(id).await.unwrap();
    drop(h);

    let reopened = harness_with_store(
        ScriptedTransport::new([ScriptedTurn::text("Still nothing.")]),
        registry(dir.path()),
        LoopBounds::default(),
        Some(store),
    );
    let after = reopened.engine.open(id).await.unwrap();
    assert_eq!(after.messages, before.messages);
    assert_eq!(after.active_branch, before.active_branch);
    assert_eq!(after.state, ConversationState::Idle);

    let listed = reopened.engine.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title.as_deref(), Some("list files"));
    assert_eq!(listed[0].message_count, 4);

    let report = reopened.engine.send_message(id, "and now?").await.unwrap();
    assert!(report.is_normal());
    assert_eq!(reopened.engine.snapshot(id).await.unwrap().messages.len(), 6);

    reopened.engine.delete(id).await.unwrap();
    assert!(reopened.engine.list().await.unwrap().is_empty());
    assert!(matches!(
        reopened.engine.snapshot(id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_set_role_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(ScriptedTransport::new([]), registry(dir.path()), LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    h.engine.set_role(id, AgentRole::Planner).await.unwrap();
    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.role, AgentRole::Planner);
    assert_eq!(h.engine.list().await.unwrap()[0].role, AgentRole::Planner);
}

/// Store that refuses the next node append once, then behaves.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryConversationStore,
    fail_next_append: AtomicBool,
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn append_node(&self, conversation: ConversationId, node: &MessageNode) -> chatloop_core::Result<()> {
        if self.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Store("disk unavailable".into()));
        }
        self.inner.append_node(conversation, node).await
    }

    async fn fetch_node(&self, conversation: ConversationId, id: MessageId) -> chatloop_core::Result<Option<MessageNode>> {
        self.inner.fetch_node(conversation, id).await
    }

    async fn save_branches(&self, conversation: ConversationId, branches: &BranchSet) -> chatloop_core::Result<()> {
        self.inner.save_branches(conversation, branches).await
    }

    async fn set_active_branch(&self, conversation: ConversationId, branch: BranchId) -> chatloop_core::Result<()> {
        self.inner.set_active_branch(conversation, branch).await
    }

    async fn save_meta(&self, meta: &ConversationMeta) -> chatloop_core::Result<()> {
        self.inner.save_meta(meta).await
    }

    async fn load(&self, conversation: ConversationId) -> chatloop_core::Result<Option<StoredConversation>> {
        self.inner.load(conversation).await
    }

    async fn list(&self) -> chatloop_core::Result<Vec<ConversationMeta>> {
        self.inner.list().await
    }

    async fn delete(&self, conversation: ConversationId) -> chatloop_core::Result<()> {
        self.inner.delete(conversation).await
    }
}

#[tokio::test]
async fn test_failed_append_is_retried_on_next_write() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn ConversationStore> = flaky.clone();

    let transport = ScriptedTransport::new([ScriptedTurn::text("hello back")]);
    let mut h = harness_with_store(transport, registry(dir.path()), LoopBounds::default(), Some(store.clone()));
    let id = h.engine.create().await.unwrap();

    flaky.fail_next_append.store(true, Ordering::SeqCst);
    let report = h.engine.send_message(id, "hi").await.unwrap();
    assert!(report.is_normal());
    assert!(drain(&mut h.events).iter().any(|e| matches!(
        e,
        EngineEvent::Errored { message } if message.contains("disk unavailable")
    )));
    let before = h.engine.snapshot(id).await.unwrap();
    drop(h);

    let reopened = harness_with_store(
        ScriptedTransport::new([]),
        registry(dir.path()),
        LoopBounds::default(),
        Some(store),
    );
    let after = reopened.engine.open(id).await.unwrap();
    assert_eq!(after.messages, before.messages);
    assert_eq!(after.messages[0].content, MessageContent::text("hi"));
}

#[tokio::test]
async fn test_cancel_while_executing_tool() {
    let dir = tempfile::tempdir().unwrap();
    let mut tools = registry(dir.path());
    let (slow, calls) = RecordingTool::new("slow_scan", Behavior::Sleep(Duration::from_secs(30)));
    tools.register(Box::new(slow));

    let transport = ScriptedTransport::new([call("slow_scan", json!({}), true)])
        .with_fallback(ScriptedTurn::text("should never be requested"));
    let mut h = harness(transport, tools, LoopBounds::default());
    let id = h.engine.create().await.unwrap();

    let engine = h.engine.clone();
    let run = tokio::spawn(async move { engine.send_message(id, "scan").await });

    wait_for(&mut h.events, |e| {
        matches!(e, EngineEvent::StateChanged { to: ConversationState::ExecutingTool, .. })
    })
    .await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert!(h.engine.cancel(id).await.unwrap());

    let report = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.reason, TerminationReason::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.requests().await.len(), 1);

    let snapshot = h.engine.snapshot(id).await.unwrap();
    assert_eq!(snapshot.state, ConversationState::Idle);
    let last = snapshot.messages.last().unwrap();
    let result = last.tool_result().unwrap();
    assert_eq!(result.outcome, ToolOutcome::Aborted);
    assert_eq!(result.tool, "slow_scan");
    assert!(matches!(last.status, MessageStatus::Aborted { .. }));
}
