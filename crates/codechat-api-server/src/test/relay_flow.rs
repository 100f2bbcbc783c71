//! End-to-end relay behavior against scripted gateways: turn accounting,
//! streaming with persistence, failure paths and cross-session isolation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::models::chat::Role;
use crate::models::context::CodeContext;
use crate::services::conversation::{ConversationRelay, ConversationStore, LlmGateway};
use crate::services::gemini::{GatewayError, StreamChunk};
use crate::services::session_store::SessionStore;
use crate::utils::error::ApiError;

mockall::mock! {
    Gateway {}

    #[async_trait]
    impl LlmGateway for Gateway {
        async fn generate(&self, prompt: &str) -> Result<String, GatewayError>;
        async fn generate_stream(
            &self,
            prompt: &str,
        ) -> Result<mpsc::Receiver<StreamChunk>, GatewayError>;
    }
}

/// Gateway that replays a fixed script: an optional leading failure for
/// `generate`, and a fixed chunk sequence for `generate_stream`.
struct ScriptedGateway {
    answer: String,
    chunks: Vec<StreamChunk>,
    generate_calls: AtomicUsize,
    fail_first_generate: bool,
    delay: Option<Duration>,
}

impl ScriptedGateway {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            chunks: Vec::new(),
            generate_calls: AtomicUsize::new(0),
            fail_first_generate: false,
            delay: None,
        }
    }

    fn streaming(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            ..Self::answering("")
        }
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn generate(&self, _prompt: &str) -> Result<String, GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first_generate && call == 0 {
            return Err(GatewayError::Exhausted { attempts: 3 });
        }
        Ok(self.answer.clone())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, GatewayError> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                let _ = tx.send(chunk).await;
            }
        });
        Ok(rx)
    }
}

fn seeded_context() -> CodeContext {
    let mut context = CodeContext::new();
    context.insert_file("src/main.rs", b"fn main() { println!(\"hi\"); }".to_vec(), false);
    context
}

fn new_relay(
    gateway: Arc<dyn LlmGateway>,
) -> (Arc<ConversationRelay>, SessionStore, ConversationStore) {
    let sessions = SessionStore::new(Duration::from_secs(60));
    let conversations = ConversationStore::new(Duration::from_secs(60));
    let relay = Arc::new(ConversationRelay::new(
        sessions.clone(),
        conversations.clone(),
        gateway,
    ));
    (relay, sessions, conversations)
}

async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn test_ask_round_trip() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_generate()
        .returning(|_| Ok("main prints hi".to_string()));

    let (relay, sessions, conversations) = new_relay(Arc::new(gateway));
    let session_id = sessions.put(seeded_context(), Some("a CLI tool".to_string()));

    let answer = relay.ask(&session_id, "what does main do?").await.unwrap();
    assert_eq!(answer, "main prints hi");

    let conversation = conversations.get(&session_id).unwrap();
    assert_eq!(conversation.messages.len(), 2);
    assert_eq!(conversation.messages[0].role, Role::User);
    assert_eq!(conversation.messages[0].content, "what does main do?");
    assert_eq!(conversation.messages[1].role, Role::Assistant);
    // The initial prompt carried the context and the analysis.
    assert!(conversation.initial_prompt.contains("src/main.rs"));
    assert!(conversation.initial_prompt.contains("a CLI tool"));
}

#[tokio::test]
async fn test_ask_unknown_session_creates_no_conversation() {
    let (relay, _sessions, conversations) =
        new_relay(Arc::new(ScriptedGateway::answering("unused")));

    match relay.ask("no-such-session", "hello?").await {
        Err(ApiError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(conversations.is_empty());
}

#[tokio::test]
async fn test_message_counts_alternate_across_turns() {
    let (relay, sessions, conversations) =
        new_relay(Arc::new(ScriptedGateway::answering("answer")));
    let session_id = sessions.put(seeded_context(), None);

    for turn in 1..=4 {
        relay
            .ask(&session_id, &format!("question {turn}"))
            .await
            .unwrap();

        let conversation = conversations.get(&session_id).unwrap();
        assert_eq!(conversation.messages.len(), 2 * turn);
        for (i, message) in conversation.messages.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(message.role, expected);
        }
    }
}

#[tokio::test]
async fn test_stream_relays_chunks_and_persists_answer() {
    let gateway = ScriptedGateway::streaming(vec![
        StreamChunk::Delta("Hel".to_string()),
        StreamChunk::Delta("lo".to_string()),
        StreamChunk::Done {
            finish_reason: Some("STOP".to_string()),
        },
    ]);
    let (relay, sessions, conversations) = new_relay(Arc::new(gateway));
    let session_id = sessions.put(seeded_context(), None);

    let rx = relay.ask_stream(&session_id, "say hello").await.unwrap();
    let chunks = collect(rx).await;

    assert_eq!(chunks.len(), 3);
    assert!(matches!(&chunks[0], StreamChunk::Delta(t) if t == "Hel"));
    assert!(matches!(&chunks[1], StreamChunk::Delta(t) if t == "lo"));
    assert!(matches!(&chunks[2], StreamChunk::Done { .. }));

    // The channel closed after the relay task finished its write-back.
    let conversation = conversations.get(&session_id).unwrap();
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Hello");
}

#[tokio::test]
async fn test_stream_error_leaves_no_assistant_message() {
    let gateway = ScriptedGateway::streaming(vec![
        StreamChunk::Delta("par".to_string()),
        StreamChunk::Error("upstream died".to_string()),
    ]);
    let (relay, sessions, conversations) = new_relay(Arc::new(gateway));
    let session_id = sessions.put(seeded_context(), None);

    let rx = relay.ask_stream(&session_id, "question").await.unwrap();
    let chunks = collect(rx).await;

    assert_eq!(chunks.len(), 2);
    assert!(matches!(&chunks[1], StreamChunk::Error(_)));

    // Partial output is not retracted but nothing is persisted.
    let conversation = conversations.get(&session_id).unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].role, Role::User);
}

#[tokio::test]
async fn test_failed_ask_keeps_question_recorded() {
    let gateway = ScriptedGateway {
        fail_first_generate: true,
        ..ScriptedGateway::answering("second time lucky")
    };
    let (relay, sessions, conversations) = new_relay(Arc::new(gateway));
    let session_id = sessions.put(seeded_context(), None);

    assert!(relay.ask(&session_id, "first try").await.is_err());
    let conversation = conversations.get(&session_id).unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].role, Role::User);

    // A retry continues the turn count; two consecutive user entries is
    // the documented trade-off of keeping failed questions.
    let answer = relay.ask(&session_id, "first try").await.unwrap();
    assert_eq!(answer, "second time lucky");
    let conversation = conversations.get(&session_id).unwrap();
    assert_eq!(conversation.messages.len(), 3);
    assert_eq!(conversation.messages[2].role, Role::Assistant);
}

#[tokio::test]
async fn test_eviction_mid_call_is_best_effort() {
    let gateway = ScriptedGateway {
        delay: Some(Duration::from_millis(50)),
        ..ScriptedGateway::answering("late answer")
    };
    let (relay, sessions, conversations) = new_relay(Arc::new(gateway));
    let session_id = sessions.put(seeded_context(), None);

    let task = {
        let relay = relay.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { relay.ask(&session_id, "slow question").await })
    };

    // Evict both stores while the call is in flight.
    tokio::time::sleep(Duration::from_millis(10)).await;
    conversations.remove(&session_id);
    sessions.remove(&session_id);

    // The caller still gets the answer; the append was dropped and the
    // conversation is not resurrected.
    let answer = task.await.unwrap().unwrap();
    assert_eq!(answer, "late answer");
    assert!(!conversations.contains(&session_id));
}

#[tokio::test]
async fn test_concurrent_asks_stay_isolated() {
    let (relay, sessions, conversations) =
        new_relay(Arc::new(ScriptedGateway::answering("shared answer")));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let relay = relay.clone();
        let session_id = sessions.put(seeded_context(), None);
        tasks.push(tokio::spawn(async move {
            let question = format!("question {i}");
            relay.ask(&session_id, &question).await.unwrap();
            (session_id, question)
        }));
    }

    for result in futures::future::join_all(tasks).await {
        let (session_id, question) = result.unwrap();
        let conversation = conversations.get(&session_id).unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].content, question);
    }
}
