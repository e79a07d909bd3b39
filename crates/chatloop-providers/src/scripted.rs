//! Deterministic transport that replays canned turns.
//!
//! Used by tests and the CLI's `--scripted` mode. Each `send_turn` pops the
//! next [`ScriptedTurn`]; requests are recorded for later inspection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::{ModelTransport, TurnEvent, TurnRequest, TurnStream};

const DEFAULT_CHUNK_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedTurn {
    /// Stream the text in fixed-size deltas, then `Done`.
    Text(String),
    /// Emit exactly these events.
    Events(Vec<TurnEvent>),
    /// Fail before the stream starts.
    Fail(String),
    /// Start a stream that never yields.
    Hang,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedTurn::Text(text.into())
    }
}

pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
    fallback: Option<ScriptedTurn>,
    chunk_size: usize,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            delay: None,
        }
    }

    /// Replayed forever once the script runs out.
    pub fn with_fallback(mut self, turn: ScriptedTurn) -> Self {
        self.fallback = Some(turn);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleep before every emitted event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().await.push_back(turn);
    }

    /// Every request received so far, oldest first.
    pub async fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }

    fn chunk(&self, text: &str) -> Vec<TurnEvent> {
        let chars: Vec<char> = text.chars().collect();
        let mut events: Vec<TurnEvent> = chars
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, chunk)| TurnEvent::delta(i as u64 + 1, chunk.iter().collect::<String>()))
            .collect();
        events.push(TurnEvent::Done);
        events
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn send_turn(&self, request: &TurnRequest) -> anyhow::Result<TurnStream> {
        self.requests.lock().await.push(request.clone());

        let next = self.turns.lock().await.pop_front();
        let Some(turn) = next.or_else(|| self.fallback.clone()) else {
            anyhow::bail!("scripted transport has no turns left");
        };

        let events = match turn {
            ScriptedTurn::Text(text) => self.chunk(&text),
            ScriptedTurn::Events(events) => events,
            ScriptedTurn::Fail(message) => anyhow::bail!(message),
            ScriptedTurn::Hang => return Ok(Box::pin(futures::stream::pending())),
        };

        let stream = futures::stream::iter(events);
        match self.delay {
            Some(delay) => Ok(Box::pin(stream.then(move |event| async move {
                tokio::time::sleep(delay).await;
                event
            }))),
            None => Ok(Box::pin(stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(transport: &ScriptedTransport) -> anyhow::Result<Vec<TurnEvent>> {
        let stream = transport.send_turn(&TurnRequest::default()).await?;
        Ok(stream.collect().await)
    }

    #[tokio::test]
    async fn test_text_is_chunked_and_numbered() {
        let transport = ScriptedTransport::new([ScriptedTurn::text("hello world")]).with_chunk_size(4);
        let events = collect(&transport).await.unwrap();
        assert_eq!(
            events,
            vec![
                TurnEvent::delta(1, "hell"),
                TurnEvent::delta(2, "o wo"),
                TurnEvent::delta(3, "rld"),
                TurnEvent::Done,
            ]
        );
        assert_eq!(transport.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_and_fallback() {
        let transport = ScriptedTransport::new([ScriptedTurn::Fail("boom".into())]);
        assert!(collect(&transport).await.unwrap_err().to_string().contains("boom"));
        assert!(collect(&transport).await.is_err());

        let transport = ScriptedTransport::new([]).with_fallback(ScriptedTurn::text("again"));
        assert_eq!(collect(&transport).await.unwrap().len(), 2);
        assert_eq!(collect(&transport).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hang_never_yields() {
        let transport = ScriptedTransport::new([ScriptedTurn::Hang]);
        let mut stream = transport.send_turn(&TurnRequest::default()).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(next.is_err());
    }
}
