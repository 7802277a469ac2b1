use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::store::backend::{SessionStore, SessionStoreError};

/// A sealed session payload kept in memory
#[derive(Debug, Clone)]
struct StoredSession {
    data: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// In-memory implementation of SessionStore, meant for development and tests.
///
/// Entries optionally expire `ttl` after their last save; expired entries are
/// invisible to `load` and removed by `cleanup_expired_sessions`.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    /// Thread-safe storage of sessions
    sessions: Arc<RwLock<HashMap<String, StoredSession>>>,
    ttl: Option<Duration>,
}

impl InMemorySessionStore {
    /// Create a new InMemorySessionStore whose entries never expire
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose entries expire `ttl` after their last save. A zero
    /// `ttl` matches browser-session cookies and never expires entries.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete expired sessions, returning how many were removed
    pub fn cleanup_expired_sessions(&self) -> Result<usize, SessionStoreError> {
        let mut sessions = self.sessions.write().map_err(|e| {
            SessionStoreError::StorageError(format!("Failed to acquire write lock: {}", e))
        })?;

        let now = Utc::now();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = !session.is_expired(now);
            if !keep {
                debug!("Cleaned up expired session: {}", id);
            }
            keep
        });

        let count = before - sessions.len();
        if count > 0 {
            warn!("Cleaned up {} expired sessions", count);
        }

        Ok(count)
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        now.checked_add_signed(ttl)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Result<Vec<u8>, SessionStoreError> {
        let sessions = self.sessions.read().map_err(|e| {
            SessionStoreError::StorageError(format!("Failed to acquire read lock: {}", e))
        })?;

        let session = sessions
            .get(id)
            .ok_or_else(|| SessionStoreError::NotFound(id.to_string()))?;

        if session.is_expired(Utc::now()) {
            return Err(SessionStoreError::NotFound(format!("Session expired: {}", id)));
        }

        Ok(session.data.clone())
    }

    async fn save(&self, id: &str, data: &[u8]) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().map_err(|e| {
            SessionStoreError::StorageError(format!("Failed to acquire write lock: {}", e))
        })?;

        let session = StoredSession {
            data: data.to_vec(),
            expires_at: self.expiry_from(Utc::now()),
        };
        sessions.insert(id.to_string(), session);
        debug!("Saved session: {} ({} bytes)", id, data.len());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().map_err(|e| {
            SessionStoreError::StorageError(format!("Failed to acquire write lock: {}", e))
        })?;

        // Destroying a session that was never saved is not an error.
        if sessions.remove(id).is_some() {
            debug!("Deleted session: {}", id);
        }
        Ok(())
    }
}
