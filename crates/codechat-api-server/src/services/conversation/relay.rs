use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::store::ConversationStore;
use super::types::ConversationContext;
use crate::models::chat::ChatMessage;
use crate::services::gemini::{GatewayError, StreamChunk};
use crate::services::prompt;
use crate::services::session_store::SessionStore;
use crate::utils::error::ApiError;

/// Channel capacity for chunks relayed to the caller.
const RELAY_CHANNEL_CAPACITY: usize = 100;

/// Seam between the relay and the outbound LLM call, so the relay can be
/// exercised against scripted gateways.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GatewayError>;

    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, GatewayError>;
}

#[async_trait]
impl LlmGateway for crate::services::gemini::GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GatewayError> {
        // Inherent method; resolution prefers it over this trait method.
        Self::generate(self, prompt).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, GatewayError> {
        Self::generate_stream(self, prompt).await
    }
}

/// Orchestrates one question: session lookup, lazy conversation creation,
/// prompt assembly, the gateway call and the history write-back. Stores are
/// constructed once at startup and injected; no map lock is ever held
/// across the LLM call.
pub struct ConversationRelay {
    sessions: SessionStore,
    conversations: ConversationStore,
    gateway: Arc<dyn LlmGateway>,
}

impl ConversationRelay {
    pub fn new(
        sessions: SessionStore,
        conversations: ConversationStore,
        gateway: Arc<dyn LlmGateway>,
    ) -> Self {
        Self {
            sessions,
            conversations,
            gateway,
        }
    }

    /// Record the user's question and build the outbound prompt: full code
    /// context on the first turn, context plus a sliding dialogue window
    /// afterwards. Fails without creating a conversation when the session
    /// is unknown or expired.
    fn begin_turn(&self, session_id: &str, question: &str) -> Result<String, ApiError> {
        let session = self.sessions.get(session_id).ok_or_else(|| {
            ApiError::NotFound(
                "session not found or expired, upload the code again".to_string(),
            )
        })?;

        let prompt = self.conversations.with_entry(
            session_id,
            || {
                ConversationContext::new(prompt::build_initial_prompt(
                    &session.context,
                    session.analysis.as_deref(),
                ))
            },
            |context| {
                context.touch();
                context.messages.push(ChatMessage::user(question));
                if context.messages.len() == 1 {
                    prompt::first_turn_prompt(&context.initial_prompt, question)
                } else {
                    prompt::build_followup_prompt(
                        &context.initial_prompt,
                        &context.messages,
                        prompt::HISTORY_WINDOW,
                    )
                }
            },
        );

        Ok(prompt)
    }

    /// Answer one question synchronously.
    pub async fn ask(&self, session_id: &str, question: &str) -> Result<String, ApiError> {
        let prompt = self.begin_turn(session_id, question)?;
        debug!(session_id, prompt_length = prompt.len(), "asking code question");

        let answer = self.gateway.generate(&prompt).await.map_err(ApiError::from)?;

        // Best-effort: the conversation may have been evicted mid-call, in
        // which case the answer is dropped along with it.
        if !self.conversations.append_assistant(session_id, &answer) {
            debug!(session_id, "conversation evicted mid-call, answer not persisted");
        }

        Ok(answer)
    }

    /// Answer one question as a live chunk stream. The returned channel
    /// yields each fragment as it arrives and closes after a terminal
    /// chunk. If the caller goes away, forwarding stops but the upstream
    /// stream is drained to completion so the full answer still lands in
    /// the conversation history.
    pub async fn ask_stream(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, ApiError> {
        let prompt = self.begin_turn(session_id, question)?;
        debug!(session_id, prompt_length = prompt.len(), "asking code question (stream)");

        let mut upstream = self
            .gateway
            .generate_stream(&prompt)
            .await
            .map_err(ApiError::from)?;

        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        let conversations = self.conversations.clone();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let mut answer = String::new();
            let mut failed = false;
            let mut forwarding = true;

            while let Some(chunk) = upstream.recv().await {
                match &chunk {
                    StreamChunk::Delta(text) => answer.push_str(text),
                    StreamChunk::Error(message) => {
                        warn!(session_id = %session_id, error = %message, "stream ended with error");
                        failed = true;
                    }
                    StreamChunk::Done { .. } => {}
                }

                if forwarding && tx.send(chunk).await.is_err() {
                    debug!(session_id = %session_id, "caller disconnected, draining upstream");
                    forwarding = false;
                }
            }

            if failed {
                // Partial output already forwarded is not retracted, but a
                // failed turn leaves no assistant message behind.
                return;
            }
            if answer.is_empty() {
                warn!(session_id = %session_id, "stream produced no content");
                return;
            }
            if !conversations.append_assistant(&session_id, &answer) {
                debug!(session_id = %session_id, "conversation evicted mid-stream, answer not persisted");
            }
        });

        Ok(rx)
    }
}
