use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::context::CodeContext;

/// One stored code context plus its optional architecture analysis.
#[derive(Clone)]
pub struct SessionEntry {
    pub context: Arc<CodeContext>,
    pub analysis: Option<String>,
    pub created_at: Instant,
}

impl SessionEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Thread-safe in-memory session storage keyed by opaque UUID handles.
/// Entries expire on a fixed TTL from creation; a background sweeper
/// physically removes them, and `get` treats unswept-but-expired entries
/// as absent.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<DashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            storage: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Store a context and return a fresh session handle.
    pub fn put(&self, context: CodeContext, analysis: Option<String>) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.storage.insert(
            session_id.clone(),
            SessionEntry {
                context: Arc::new(context),
                analysis,
                created_at: Instant::now(),
            },
        );
        debug!(session_id = %session_id, "session stored");
        session_id
    }

    /// Look up a session; expired entries behave as absent.
    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        let entry = self.storage.get(session_id)?;
        let session = entry.value().clone();

        if session.is_expired(self.ttl) {
            drop(entry);
            self.storage.remove(session_id);
            debug!(session_id, "session expired, removed from store");
            return None;
        }

        Some(session)
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        self.storage.remove(session_id).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Physically remove every expired entry. Returns the removal count.
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.storage.len();
        self.storage.retain(|_, entry| !entry.is_expired(ttl));
        let removed = before.saturating_sub(self.storage.len());

        if removed > 0 {
            info!("cleaned up {} expired sessions", removed);
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
