//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use chatloop_agent::{ConversationEvent, Engine};
use chatloop_core::config::{LoopBounds, ToolsConfig};
use chatloop_core::event::EngineEvent;
use chatloop_core::store::ConversationStore;
use chatloop_providers::{ScriptedTransport, ScriptedTurn};
use chatloop_tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

/// Raw model output for a tool call.
pub fn call(tool: &str, params: Value, cont: bool) -> ScriptedTurn {
    ScriptedTurn::text(json!({ "tool": tool, "parameters": params, "continue": cont }).to_string())
}

#[derive(Clone)]
pub enum Behavior {
    Reply(String),
    Fail(String),
    Sleep(Duration),
}

/// Test tool that counts executions.
pub struct RecordingTool {
    pub name: &'static str,
    pub read_only: bool,
    pub approval: bool,
    pub behavior: Behavior,
    pub calls: Arc<AtomicUsize>,
}

impl RecordingTool {
    pub fn new(name: &'static str, behavior: Behavior) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = Self {
            name,
            read_only: false,
            approval: false,
            behavior,
            calls: calls.clone(),
        };
        (tool, calls)
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn gated(mut self) -> Self {
        self.approval = true;
        self
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Recording tool for tests"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn requires_approval(&self) -> bool {
        self.approval
    }

    async fn execute(&self, _params: Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Reply(text) => Ok(ToolOutput::ok(text.clone())),
            Behavior::Fail(reason) => Ok(ToolOutput::error(reason.clone())),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(ToolOutput::ok("woke up"))
            }
        }
    }
}

/// Registry with the built-in tools rooted at `workspace`.
pub fn registry(workspace: &Path) -> ToolRegistry {
    let context = ToolContext {
        workspace: workspace.to_path_buf(),
        restrict_to_workspace: true,
    };
    ToolRegistry::with_builtins(context, &ToolsConfig::default())
}

pub struct Harness {
    pub engine: Engine,
    pub transport: Arc<ScriptedTransport>,
    pub events: mpsc::UnboundedReceiver<ConversationEvent>,
}

pub fn harness(transport: ScriptedTransport, tools: ToolRegistry, bounds: LoopBounds) -> Harness {
    harness_with_store(transport, tools, bounds, None)
}

pub fn harness_with_store(
    transport: ScriptedTransport,
    tools: ToolRegistry,
    bounds: LoopBounds,
    store: Option<Arc<dyn ConversationStore>>,
) -> Harness {
    let transport = Arc::new(transport);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut builder = Engine::builder(transport.clone(), Arc::new(tools))
        .bounds(bounds)
        .events(tx);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    Harness {
        engine: builder.build(),
        transport,
        events: rx,
    }
}

/// Wait (up to five seconds) for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<ConversationEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event.event) {
                return event.event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Everything currently buffered on the channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}
