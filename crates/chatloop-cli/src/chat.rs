//! Interactive chat: streams replies to stdout and asks for tool approvals.

use std::io::Write;

use dialoguer::{Confirm, Input};
use tokio::sync::mpsc;
use tracing::debug;

use chatloop_agent::{ConversationEvent, Engine};
use chatloop_core::event::EngineEvent;
use chatloop_core::message::{ConversationId, MessageContent, ToolCallId, ToolOutcome, ToolParams};
use chatloop_core::role::AgentRole;

enum Step<T> {
    Finished(T),
    Event(ConversationEvent),
    Interrupted,
}

pub struct ChatSession {
    engine: Engine,
    id: ConversationId,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    mid_line: bool,
    /// Streamed text held back while it may still be a tool call or plan.
    held: String,
    live: bool,
}

impl ChatSession {
    pub fn new(engine: Engine, id: ConversationId, events: mpsc::UnboundedReceiver<ConversationEvent>) -> Self {
        Self {
            engine,
            id,
            events,
            mid_line: false,
            held: String::new(),
            live: false,
        }
    }

    /// Read lines until `/exit` or end of input.
    pub async fn repl(&mut self) -> anyhow::Result<()> {
        println!("Conversation {} (/exit to quit, /planner or /actor to switch role)", self.id);
        loop {
            let line = tokio::task::spawn_blocking(|| {
                Input::<String>::new()
                    .with_prompt("you")
                    .allow_empty(true)
                    .interact_text()
            })
            .await??;

            match line.trim() {
                "" => continue,
                "/exit" | "/quit" => break,
                "/planner" => self.switch_role(AgentRole::Planner).await,
                "/actor" => self.switch_role(AgentRole::Actor).await,
                text => {
                    if let Err(e) = self.turn(text.to_string()).await {
                        eprintln!("error: {e:#}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn switch_role(&self, role: AgentRole) {
        match self.engine.set_role(self.id, role).await {
            Ok(()) => println!("Role set to {role}"),
            Err(e) => eprintln!("error: {e}"),
        }
    }

    /// Send one message and render events until the loop terminates.
    pub async fn turn(&mut self, text: String) -> anyhow::Result<()> {
        let engine = self.engine.clone();
        let id = self.id;
        let mut run = tokio::spawn(async move { engine.send_message(id, text).await });

        let report = loop {
            let step = tokio::select! {
                joined = &mut run => Step::Finished(joined),
                Some(event) = self.events.recv() => Step::Event(event),
                _ = tokio::signal::ctrl_c() => Step::Interrupted,
            };
            match step {
                Step::Finished(joined) => break joined?,
                Step::Event(event) => self.handle(event).await?,
                Step::Interrupted => {
                    if self.engine.cancel(self.id).await? {
                        eprintln!("\ncancelling...");
                    }
                }
            }
        };

        while let Ok(event) = self.events.try_recv() {
            self.handle(event).await?;
        }
        self.release_held()?;
        self.end_line();

        let report = report?;
        debug!(
            iterations = report.iterations,
            tool_calls = report.tool_calls,
            duration_ms = report.duration_ms,
            "Turn finished"
        );
        Ok(())
    }

    async fn handle(&mut self, event: ConversationEvent) -> anyhow::Result<()> {
        match event.event {
            EngineEvent::StreamingDelta { text, .. } => {
                if self.live {
                    self.print_stream(&text)?;
                } else {
                    self.held.push_str(&text);
                    let head = self.held.trim_start();
                    if !head.is_empty() && !looks_structured(head) {
                        self.live = true;
                        self.release_held()?;
                    }
                }
            }
            EngineEvent::MessageAppended { node } => {
                match &node.content {
                    MessageContent::Text { .. } => self.release_held()?,
                    _ => self.held.clear(),
                }
                self.live = false;
                self.show_message(&node.content);
            }
            EngineEvent::ApprovalRequested { call_id, tool, params } => {
                self.end_line();
                self.ask_approval(call_id, tool, params).await?;
            }
            EngineEvent::LoopTerminated { reason } => {
                if !reason.is_normal() {
                    self.end_line();
                    eprintln!("{}", reason.marker_text());
                }
            }
            EngineEvent::Errored { message } => {
                self.end_line();
                eprintln!("error: {message}");
            }
            EngineEvent::StateChanged { from, to } => {
                debug!(conversation_id = %event.conversation_id, %from, %to, "State changed");
            }
        }
        Ok(())
    }

    fn show_message(&mut self, content: &MessageContent) {
        match content {
            MessageContent::Invocation { invocations } => {
                self.end_line();
                for inv in invocations {
                    println!("-> {} {}", inv.tool, serde_json::Value::Object(inv.params.clone()));
                }
            }
            MessageContent::ToolResult { result } => {
                self.end_line();
                let label = match result.outcome {
                    ToolOutcome::Success => "ok",
                    ToolOutcome::Failure => "failed",
                    ToolOutcome::Rejected => "rejected",
                    ToolOutcome::Aborted => "aborted",
                };
                let first = result.output.lines().next().unwrap_or_default();
                println!("<- {} [{label}] {first}", result.tool);
            }
            MessageContent::Plan { .. } | MessageContent::Question { .. } => {
                self.end_line();
                println!("{}", content.render());
            }
            MessageContent::Text { .. } => self.end_line(),
        }
    }

    fn print_stream(&mut self, text: &str) -> anyhow::Result<()> {
        print!("{text}");
        std::io::stdout().flush()?;
        self.mid_line = true;
        Ok(())
    }

    fn release_held(&mut self) -> anyhow::Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        let held = std::mem::take(&mut self.held);
        self.print_stream(&held)
    }

    /// Ask on the terminal. Esc, `q`, or Ctrl-C cancels the whole run.
    async fn ask_approval(&self, call_id: ToolCallId, tool: String, params: ToolParams) -> anyhow::Result<()> {
        let prompt = format!(
            "Run tool '{tool}' with {}? (Esc cancels the run)",
            serde_json::Value::Object(params)
        );
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new().with_prompt(prompt).default(false).interact_opt()
        });
        let decision = tokio::select! {
            answer = answer => answer??,
            _ = tokio::signal::ctrl_c() => None,
        };

        let resolved = match decision {
            Some(true) => self.engine.approve(self.id, call_id).await?,
            Some(false) => self.engine.reject(self.id, call_id).await?,
            None => {
                eprintln!("cancelling...");
                self.engine.cancel(self.id).await?
            }
        };
        if !resolved {
            eprintln!("Approval for {call_id} is no longer pending");
        }
        Ok(())
    }

    fn end_line(&mut self) {
        if std::mem::take(&mut self.mid_line) {
            println!();
        }
    }
}

/// Whether streamed text so far could be a tool call, plan, or question payload.
fn looks_structured(head: &str) -> bool {
    head.starts_with('{') || head.starts_with("```") || "```".starts_with(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_prefixes_are_held() {
        assert!(looks_structured("{\"tool\""));
        assert!(looks_structured("`"));
        assert!(looks_structured("```json"));
        assert!(!looks_structured("Found 3 files."));
        assert!(!looks_structured("`code` is inline"));
    }
}
