use std::error::Error;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use async_trait::async_trait;

/// Error type for session store operations
#[derive(Debug)]
pub enum SessionStoreError {
    /// Session not found (never saved, destroyed or expired)
    NotFound(String),
    /// Error occurred during a store operation
    StorageError(String),
    /// The store did not answer within the configured timeout
    Timeout(&'static str),
}

impl Display for SessionStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStoreError::NotFound(id) => write!(f, "Session not found: {}", id),
            SessionStoreError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            SessionStoreError::Timeout(op) => write!(f, "Session store {} timed out", op),
        }
    }
}

impl Error for SessionStoreError {}

/// Trait defining the interface for external session stores.
///
/// Stores only ever see sealed session payloads keyed by an opaque session ID.
/// Calls for different IDs may run concurrently; no locking is provided for
/// concurrent requests sharing one ID (the last save wins).
#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    /// Retrieve the sealed payload saved under `id`.
    ///
    /// Returns [`SessionStoreError::NotFound`] when nothing is stored.
    async fn load(&self, id: &str) -> Result<Vec<u8>, SessionStoreError>;

    /// Persist the sealed payload under `id`, replacing any previous value
    async fn save(&self, id: &str, data: &[u8]) -> Result<(), SessionStoreError>;

    /// Remove the session altogether from the store
    async fn destroy(&self, id: &str) -> Result<(), SessionStoreError>;
}

/// Type alias for Arc-wrapped SessionStore trait objects
pub type SessionStoreRef = Arc<dyn SessionStore>;
