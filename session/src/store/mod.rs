//! Pluggable session stores
//!
//! By default session data travels inside the encrypted cookie itself. When a
//! `SessionStore` is configured, the cookie only carries a random session ID and
//! the sealed payload is kept by the store under that ID.

pub mod adapters;
pub mod backend;

pub use adapters::InMemorySessionStore;
pub use backend::{SessionStore, SessionStoreError, SessionStoreRef};
