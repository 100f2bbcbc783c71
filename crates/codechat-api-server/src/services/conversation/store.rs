use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::types::ConversationContext;
use crate::models::chat::ChatMessage;

/// Thread-safe conversation storage, keyed by the same handles as the
/// session store but with its own, longer idle TTL: a session can exist
/// with no conversation yet, and conversations expire on a different
/// clock. Shard locks are held only for map operations.
#[derive(Clone)]
pub struct ConversationStore {
    storage: Arc<DashMap<String, ConversationContext>>,
    ttl: Duration,
}

impl ConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            storage: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Look up or lazily create the conversation for a handle, then run
    /// `f` against it under the shard lock. A stale (idle-expired but
    /// unswept) entry is replaced instead of reused.
    pub fn with_entry<R>(
        &self,
        session_id: &str,
        create: impl FnOnce() -> ConversationContext,
        f: impl FnOnce(&mut ConversationContext) -> R,
    ) -> R {
        match self.storage.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_idle(self.ttl) {
                    debug!(session_id, "replacing idle-expired conversation");
                    occupied.insert(create());
                }
                f(occupied.get_mut())
            }
            Entry::Vacant(vacant) => {
                debug!(session_id, "created conversation context");
                let mut entry = vacant.insert(create());
                f(entry.value_mut())
            }
        }
    }

    /// Snapshot a conversation; idle entries behave as absent.
    pub fn get(&self, session_id: &str) -> Option<ConversationContext> {
        let entry = self.storage.get(session_id)?;
        let context = entry.value().clone();

        if context.is_idle(self.ttl) {
            drop(entry);
            self.storage.remove(session_id);
            debug!(session_id, "conversation idle-expired, removed");
            return None;
        }

        Some(context)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.storage
            .get(session_id)
            .map(|entry| !entry.is_idle(self.ttl))
            .unwrap_or(false)
    }

    /// Append the assistant's answer. Best-effort: returns false when the
    /// conversation was evicted while the LLM call was in flight.
    pub fn append_assistant(&self, session_id: &str, content: &str) -> bool {
        match self.storage.get_mut(session_id) {
            Some(mut entry) => {
                entry.messages.push(ChatMessage::assistant(content));
                entry.touch();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<ConversationContext> {
        self.storage.remove(session_id).map(|(_, context)| context)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.storage.len();
        self.storage.retain(|_, context| !context.is_idle(ttl));
        let removed = before.saturating_sub(self.storage.len());

        if removed > 0 {
            info!("cleaned up {} idle conversations", removed);
        }

        removed
    }

    /// Run `cleanup_expired` on a fixed period for the process lifetime.
    pub fn spawn_sweeper(&self, period: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.cleanup_expired();
            }
        });
    }
}
