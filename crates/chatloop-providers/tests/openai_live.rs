//! Live OpenAI round trip, skipped unless `OPENAI_API_KEY` is set.
//!
//! Run with: `cargo test -p chatloop-providers --test openai_live`

use chatloop_core::message::{MessageContent, Role};
use chatloop_core::pool::MessagePool;
use chatloop_providers::{ModelTransport, OpenAiTransport, TurnEvent, TurnRequest};
use tokio_stream::StreamExt;

fn openai_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
}

#[tokio::test]
async fn test_openai_streams_numbered_deltas() {
    let Some(key) = openai_key() else {
        eprintln!("OPENAI_API_KEY not set, skipping");
        return;
    };

    let mut pool = MessagePool::new();
    let id = pool
        .create_node(Role::User, MessageContent::text("Reply with exactly the word 'hello'."), None)
        .unwrap();
    let request = TurnRequest {
        system: Some("Follow instructions exactly.".into()),
        messages: vec![pool.get(id).unwrap().clone()],
    };

    let transport = OpenAiTransport::new("gpt-4o-mini", Some(key));
    let mut stream = transport.send_turn(&request).await.unwrap();

    let mut text = String::new();
    let mut expected = 1;
    let mut finished = false;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Delta { seq, text: chunk } => {
                assert_eq!(seq, expected);
                expected += 1;
                text.push_str(&chunk);
            }
            TurnEvent::Done => finished = true,
            TurnEvent::Error { message } => panic!("stream error: {message}"),
        }
    }
    assert!(finished);
    assert!(text.to_lowercase().contains("hello"), "got: {text}");
}
