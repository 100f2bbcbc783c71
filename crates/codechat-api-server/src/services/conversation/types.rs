use std::time::{Duration, Instant};

use crate::models::chat::ChatMessage;

/// Accumulating dialogue state for one session handle. The initial prompt
/// is built once from the session's code context and never rebuilt; the
/// message history only grows while the conversation is live.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    /// Full-context prompt, computed lazily on the first question.
    pub initial_prompt: String,

    /// Ordered user/assistant messages, append-only.
    pub messages: Vec<ChatMessage>,

    /// Updated on every turn; idle conversations are evicted.
    pub last_active: Instant,
}

impl ConversationContext {
    pub fn new(initial_prompt: String) -> Self {
        Self {
            initial_prompt,
            messages: Vec::new(),
            last_active: Instant::now(),
        }
    }

    pub fn is_idle(&self, ttl: Duration) -> bool {
        self.last_active.elapsed() > ttl
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }
}
