//! Encrypted, authenticated HTTP sessions for axum.
//!
//! Session data is serialized to JSON and sealed with XChaCha20-Poly1305. By
//! default the sealed data is the session cookie's value; with a
//! [`SessionStore`] configured, the cookie only carries a random session ID and
//! the sealed data lives in the store.

// Authenticated encryption and key rotation
pub mod codec;

// Session middleware configuration
pub mod config;

// Shared error types
pub mod errors;

// Request lifecycle: load, attach, save
pub mod handler;

// Session map (de)serialization and custom type registry
pub mod serializer;

// The per-request session entity and its handle
pub mod session;

// Pluggable backing stores
pub mod store;

pub use codec::{CodecError, KeyRing, SecretKey};
pub use config::{DecodeFailurePolicy, SessionConfig};
pub use errors::{SessionError, SessionResult};
pub use handler::{manage_sessions, SessionManager};
pub use serializer::{SerializeError, Serializer, SessionValue, TypeRegistry};
pub use session::{Session, SessionCookie, SessionHandle};
pub use store::{InMemorySessionStore, SessionStore, SessionStoreError, SessionStoreRef};
