//! OpenAI Chat Completions transport.
//!
//! Streams `/v1/chat/completions` and numbers each content delta. Works with
//! any OpenAI-compatible endpoint (OpenRouter, Ollama, vLLM) via `base_url`.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use chatloop_core::config::ProviderConfig;
use chatloop_core::message::{MessageContent, MessageNode, Role};

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{ModelTransport, TurnEvent, TurnRequest, TurnStream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct OpenAiTransport {
    pub base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl OpenAiTransport {
    pub fn new(model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            api_key,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut transport = Self::new(
            config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            config.resolve_api_key(),
        );
        if let Some(base_url) = &config.base_url {
            transport.base_url = base_url.trim_end_matches('/').to_string();
        }
        transport.max_tokens = config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        transport.temperature = config.temperature;
        transport
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Map the active branch to chat messages.
///
/// Tool results go back as user messages; other system-role nodes (markers,
/// corrective instructions) stay system messages.
pub fn format_messages(system: Option<&str>, nodes: &[MessageNode]) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(nodes.len() + 1);
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }

    for node in nodes {
        let role = match (&node.role, &node.content) {
            (_, MessageContent::ToolResult { .. }) => "user",
            (Role::User, _) => "user",
            (Role::Assistant, _) => "assistant",
            (Role::System, _) => "system",
        };
        let text = node.content.render();
        if text.trim().is_empty() {
            continue;
        }
        messages.push(json!({ "role": role, "content": text }));
    }
    messages
}

struct ChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    seq: u64,
    finished: bool,
    done: bool,
}

#[async_trait]
impl ModelTransport for OpenAiTransport {
    fn id(&self) -> &str {
        "openai"
    }

    async fn send_turn(&self, request: &TurnRequest) -> anyhow::Result<TurnStream> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: format_messages(request.system.as_deref(), &request.messages),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(model = %body.model, base_url = %self.base_url, messages = body.messages.len(), "Streaming chat completion");

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }

        let response = builder.json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error.message)
                .unwrap_or(text);
            anyhow::bail!("OpenAI API error {status}: {message}");
        }

        let state = ChunkState {
            sse: Box::pin(parse_sse_stream(response)),
            seq: 0,
            finished: false,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                match state.sse.next().await {
                    Some(Ok(event)) => {
                        let data = event.data.trim();
                        if data == "[DONE]" {
                            state.done = true;
                            return Some((TurnEvent::Done, state));
                        }
                        if let Ok(body) = serde_json::from_str::<ErrorBody>(data) {
                            state.done = true;
                            return Some((TurnEvent::error(body.error.message), state));
                        }
                        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                            Ok(c) => c,
                            Err(e) => {
                                trace!(%e, data, "Skipping unparseable chunk");
                                continue;
                            }
                        };
                        let Some(choice) = chunk.choices.into_iter().next() else {
                            continue;
                        };
                        if choice.finish_reason.is_some() {
                            state.finished = true;
                        }
                        match choice.delta.content {
                            Some(text) if !text.is_empty() => {
                                state.seq += 1;
                                let seq = state.seq;
                                return Some((TurnEvent::Delta { seq, text }, state));
                            }
                            _ => continue,
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((TurnEvent::error(e.to_string()), state));
                    }
                    None => {
                        state.done = true;
                        let last = if state.finished {
                            TurnEvent::Done
                        } else {
                            TurnEvent::error("stream ended before completion")
                        };
                        return Some((last, state));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
