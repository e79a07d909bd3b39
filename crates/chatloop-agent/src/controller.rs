//! Agent loop controller: model turn, tool turn, repeat.
//!
//! Each iteration sends the active branch to the model, feeds the stream
//! through the conversation context, and acts on the [`StreamStep`] that
//! `finish_streaming` hands back. Iteration and wall-clock bounds are checked
//! at every iteration boundary. Cancellation is observed at every suspension
//! point.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatloop_core::config::LoopBounds;
use chatloop_core::context::StreamStep;
use chatloop_core::error::{EngineError, LoopLimit, Result};
use chatloop_core::event::TerminationReason;
use chatloop_core::message::{ConversationId, MessageId, ToolInvocation, ToolResult};
use chatloop_core::protocol::tool_failure_feedback;
use chatloop_core::role::{AgentRole, CapabilityRegistry};
use chatloop_providers::{TurnEvent, TurnRequest};
use chatloop_tools::ToolExecutor;

use crate::LoopReport;
use crate::approval::ApprovalDecision;
use crate::engine::{ConversationHandle, EngineCore};
use crate::prompt::{PromptInputs, build_system_prompt};

/// Capability view of the executor for the context's gating decisions.
struct Capabilities<'a>(&'a dyn ToolExecutor);

impl CapabilityRegistry for Capabilities<'_> {
    fn is_known(&self, tool: &str) -> bool {
        self.0.is_known(tool)
    }

    fn is_read_only(&self, tool: &str) -> bool {
        self.0.is_read_only(tool)
    }

    fn requires_approval(&self, tool: &str) -> bool {
        self.0.requires_approval(tool)
    }

    fn visible_tools(&self, role: AgentRole) -> Vec<String> {
        self.0.visible_tools(role)
    }
}

/// Counters for one loop run.
struct LoopRun {
    conversation_id: ConversationId,
    started: Instant,
    bounds: LoopBounds,
    iterations: u32,
    tool_calls: u32,
    consecutive_malformed: u32,
    malformed_retries: u32,
    /// Tool name and how many times in a row it has failed.
    failures: Option<(String, u32)>,
    final_message: Option<MessageId>,
}

impl LoopRun {
    fn report(self, reason: TerminationReason) -> LoopReport {
        LoopReport {
            conversation_id: self.conversation_id,
            reason,
            iterations: self.iterations,
            tool_calls: self.tool_calls,
            malformed_retries: self.malformed_retries,
            duration_ms: self.started.elapsed().as_millis() as u64,
            final_message: self.final_message,
        }
    }

    /// Record a tool result and return the current failure streak.
    fn record_tool_result(&mut self, tool: &str, result: &ToolResult) -> u32 {
        if !result.is_error() {
            self.failures = None;
            return 0;
        }
        let streak = match &self.failures {
            Some((last, count)) if last == tool => count + 1,
            _ => 1,
        };
        self.failures = Some((tool.to_string(), streak));
        streak
    }
}

impl EngineCore {
    pub(crate) async fn run_loop(
        &self,
        handle: &ConversationHandle,
        cancel: CancellationToken,
    ) -> Result<LoopReport> {
        let (conversation_id, bounds) = {
            let context = handle.context.lock().await;
            (context.id(), context.bounds())
        };
        let mut run = LoopRun {
            conversation_id,
            started: Instant::now(),
            bounds,
            iterations: 0,
            tool_calls: 0,
            consecutive_malformed: 0,
            malformed_retries: 0,
            failures: None,
            final_message: None,
        };

        let outcome = self.drive(handle, &cancel, &mut run).await;
        handle.approvals.clear();

        let reason = outcome?;
        info!(
            conversation_id = %conversation_id,
            reason = ?reason,
            iterations = run.iterations,
            tool_calls = run.tool_calls,
            "Agent loop finished"
        );
        Ok(run.report(reason))
    }

    async fn drive(
        &self,
        handle: &ConversationHandle,
        cancel: &CancellationToken,
        run: &mut LoopRun,
    ) -> Result<TerminationReason> {
        loop {
            if cancel.is_cancelled() {
                return self.abort(handle, TerminationReason::Cancelled).await;
            }
            run.iterations += 1;
            if run.iterations > run.bounds.max_iterations {
                warn!(conversation_id = %run.conversation_id, max = run.bounds.max_iterations, "Iteration ceiling reached");
                return self.abort(handle, limit(LoopLimit::Iterations)).await;
            }
            if run.started.elapsed() > run.bounds.loop_timeout {
                warn!(conversation_id = %run.conversation_id, timeout = ?run.bounds.loop_timeout, "Wall-clock budget exhausted");
                return self.abort(handle, limit(LoopLimit::WallClock)).await;
            }
            debug!(conversation_id = %run.conversation_id, iteration = run.iterations, "Agent loop iteration");

            if let Some(reason) = self.model_turn(handle, cancel).await? {
                return Ok(reason);
            }

            let caps = Capabilities(self.tools.as_ref());
            let (step, approval) = self
                .with_context(handle, |context| {
                    let step = context.finish_streaming(&caps)?;
                    let waiter = match &step {
                        StreamStep::AwaitApproval(invocation) => Some(handle.approvals.arm(invocation.id)),
                        _ => None,
                    };
                    Ok((step, waiter))
                })
                .await?;

            let next = match (step, approval) {
                (StreamStep::Done(id), _) => {
                    run.final_message = Some(id);
                    Some(self.finish(handle, TerminationReason::Normal).await?)
                }
                (StreamStep::Malformed { reason }, _) => {
                    run.consecutive_malformed += 1;
                    if run.consecutive_malformed > run.bounds.max_malformed_retries {
                        warn!(conversation_id = %run.conversation_id, attempts = run.consecutive_malformed, "Giving up on malformed tool calls");
                        let attempts = run.consecutive_malformed;
                        Some(self.abort(handle, TerminationReason::ProtocolViolation { attempts }).await?)
                    } else {
                        run.malformed_retries += 1;
                        warn!(
                            conversation_id = %run.conversation_id,
                            attempt = run.consecutive_malformed,
                            %reason,
                            "Malformed tool call, sending corrective instruction"
                        );
                        self.with_context(handle, |context| context.append_corrective(&reason))
                            .await?;
                        None
                    }
                }
                (StreamStep::Execute(invocation), _) => {
                    run.consecutive_malformed = 0;
                    self.execute(handle, cancel, run, invocation).await?
                }
                (StreamStep::AwaitApproval(invocation), Some(waiter)) => {
                    run.consecutive_malformed = 0;
                    let decision = tokio::select! {
                        _ = cancel.cancelled() => return self.abort(handle, TerminationReason::Cancelled).await,
                        decision = waiter => decision,
                    };
                    match decision {
                        Ok(ApprovalDecision::Approve) => {
                            let call_id = invocation.id;
                            let approved = self
                                .with_context(handle, |context| Ok(context.approve(call_id)))
                                .await?;
                            match approved {
                                Some(invocation) => self.execute(handle, cancel, run, invocation).await?,
                                None => Some(self.abort(handle, TerminationReason::Cancelled).await?),
                            }
                        }
                        Ok(ApprovalDecision::Reject) => {
                            let reason = TerminationReason::Rejected { call_id: invocation.id };
                            let marker = reason.clone();
                            self.with_context(handle, |context| {
                                context.reject(invocation.id)?;
                                context.loop_terminated(marker);
                                Ok(())
                            })
                            .await?;
                            Some(reason)
                        }
                        Err(_) => Some(self.abort(handle, TerminationReason::Cancelled).await?),
                    }
                }
                (StreamStep::AwaitApproval(invocation), None) => {
                    return Err(EngineError::Other(anyhow::anyhow!(
                        "no approval waiter armed for call {}",
                        invocation.id
                    )));
                }
                (StreamStep::Denied { invocation, result }, _) => {
                    run.consecutive_malformed = 0;
                    self.after_tool(handle, run, &invocation, &result).await?
                }
                (StreamStep::Ignored, _) => {
                    return Err(EngineError::Other(anyhow::anyhow!(
                        "conversation {} stopped streaming unexpectedly",
                        run.conversation_id
                    )));
                }
            };

            if let Some(reason) = next {
                return Ok(reason);
            }
        }
    }

    /// Request a model turn and stream it into the context. Returns a
    /// termination reason if the turn was cancelled.
    async fn model_turn(
        &self,
        handle: &ConversationHandle,
        cancel: &CancellationToken,
    ) -> Result<Option<TerminationReason>> {
        let request = self.turn_request(handle).await;

        let started = tokio::select! {
            _ = cancel.cancelled() => return self.abort(handle, TerminationReason::Cancelled).await.map(Some),
            started = self.transport.send_turn(&request) => started,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => return self.fail_turn(handle, format!("{e:#}")).await,
        };

        let opened = self.with_context(handle, |context| context.begin_streaming()).await?;
        if opened.is_none() {
            return Err(EngineError::Other(anyhow::anyhow!(
                "conversation was not awaiting the model"
            )));
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return self.abort(handle, TerminationReason::Cancelled).await.map(Some),
                event = stream.next() => event,
            };
            match event {
                Some(TurnEvent::Delta { seq, text }) => {
                    let applied = self
                        .with_context(handle, |context| context.apply_delta(seq, &text))
                        .await;
                    if let Err(e) = applied {
                        warn!(seq, error = %e, "Model stream lost sync");
                        let message = e.to_string();
                        self.with_context(handle, |context| context.handle_model_error(message))
                            .await?;
                        return Err(e);
                    }
                }
                Some(TurnEvent::Done) => return Ok(None),
                Some(TurnEvent::Error { message }) => return self.fail_turn(handle, message).await,
                None => {
                    return self
                        .fail_turn(handle, "model stream ended without completing".to_string())
                        .await;
                }
            }
        }
    }

    async fn turn_request(&self, handle: &ConversationHandle) -> TurnRequest {
        let (role, messages) = {
            let context = handle.context.lock().await;
            let messages = context.messages().into_iter().cloned().collect();
            (context.role(), messages)
        };
        let catalogue = self.tools.catalogue(role);
        let system = build_system_prompt(PromptInputs {
            role,
            catalogue: &catalogue,
            workspace: self.workspace.as_deref(),
            custom: self.system_prompt.as_deref(),
        });
        TurnRequest {
            system: Some(system),
            messages,
        }
    }

    /// Run an approved or auto-dispatched invocation and record its result.
    async fn execute(
        &self,
        handle: &ConversationHandle,
        cancel: &CancellationToken,
        run: &mut LoopRun,
        invocation: ToolInvocation,
    ) -> Result<Option<TerminationReason>> {
        run.tool_calls += 1;
        info!(
            conversation_id = %run.conversation_id,
            tool = %invocation.tool,
            call_id = %invocation.id,
            "Executing tool"
        );

        let started = Instant::now();
        let timeout = run.bounds.tool_timeout;
        let call = self.tools.execute(&invocation.tool, invocation.params.clone());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return self.abort(handle, TerminationReason::Cancelled).await.map(Some),
            outcome = tokio::time::timeout(timeout, call) => outcome,
        };

        let result = match outcome {
            Ok(Ok(output)) if !output.is_error => ToolResult::success(&invocation, output.content),
            Ok(Ok(output)) => failed(&invocation, &output.content),
            Ok(Err(e)) => failed(&invocation, &format!("{e:#}")),
            Err(_) => failed(&invocation, &timed_out(timeout)),
        };
        debug!(
            tool = %invocation.tool,
            elapsed_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error(),
            "Tool finished"
        );

        let recorded = result.clone();
        self.with_context(handle, |context| context.tool_execution_complete(recorded))
            .await?;
        self.after_tool(handle, run, &invocation, &result).await
    }

    /// Apply the failure streak bound and the continuation flag.
    async fn after_tool(
        &self,
        handle: &ConversationHandle,
        run: &mut LoopRun,
        invocation: &ToolInvocation,
        result: &ToolResult,
    ) -> Result<Option<TerminationReason>> {
        let streak = run.record_tool_result(&invocation.tool, result);
        if streak > 0 {
            warn!(
                conversation_id = %run.conversation_id,
                tool = %invocation.tool,
                streak,
                "Tool call failed"
            );
        }

        if !invocation.continue_loop {
            return self.finish(handle, TerminationReason::Normal).await.map(Some);
        }
        if streak >= run.bounds.max_consecutive_tool_failures {
            return self
                .abort(handle, limit(LoopLimit::ToolFailures))
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// The loop ended through a regular transition.
    async fn finish(&self, handle: &ConversationHandle, reason: TerminationReason) -> Result<TerminationReason> {
        let marker = reason.clone();
        self.with_context(handle, |context| {
            context.loop_terminated(marker);
            Ok(())
        })
        .await?;
        Ok(reason)
    }

    /// Force-terminate: the context seals what was in flight and appends a marker.
    async fn abort(&self, handle: &ConversationHandle, reason: TerminationReason) -> Result<TerminationReason> {
        let marker = reason.clone();
        self.with_context(handle, |context| {
            if !context.abort_loop(marker.clone())? {
                context.loop_terminated(marker);
            }
            Ok(())
        })
        .await?;
        Ok(reason)
    }

    /// Transport failure: the context keeps the partial output and errors.
    async fn fail_turn<T>(&self, handle: &ConversationHandle, message: String) -> Result<T> {
        warn!(error = %message, "Model turn failed");
        let recorded = message.clone();
        self.with_context(handle, |context| context.handle_model_error(recorded))
            .await?;
        Err(EngineError::Transport(message))
    }
}

fn limit(limit: LoopLimit) -> TerminationReason {
    TerminationReason::LimitExceeded { limit }
}

fn failed(invocation: &ToolInvocation, reason: &str) -> ToolResult {
    ToolResult::failure(invocation, tool_failure_feedback(&invocation.tool, reason))
}

fn timed_out(timeout: Duration) -> String {
    format!("timed out after {timeout:?}")
}
