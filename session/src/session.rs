//! The per-request session entity.
//!
//! A [`Session`] is built by the session middleware at the start of every request,
//! handed to application handlers through a [`SessionHandle`] stored in the request
//! extensions, and persisted once after the handler produced its response.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::Extensions;
use chrono::{DateTime, Utc};
use cookie::Cookie;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::codec::{self, CodecError, KeyRing};
use crate::config::DEFAULT_COOKIE_NAME;
use crate::errors::SessionResult;
use crate::serializer::{unwrap_envelope, SerializeError, Serializer, SessionMap, SessionValue};

/// Number of random bytes in a store-backed session ID (256 bits)
pub const SESSION_ID_SIZE: usize = 32;

/// Returns a fresh, hex encoded session ID from the operating system RNG
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_SIZE];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `value` has the shape of an ID produced by [`generate_session_id`]
pub fn is_session_id(value: &str) -> bool {
    value.len() == SESSION_ID_SIZE * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Attributes of the session cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    /// Sealed session data, or the session ID when a store is configured
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// `Max-Age` in seconds. Zero leaves the attribute out; a negative value asks
    /// the browser to delete the cookie right away.
    pub max_age: i64,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            domain: None,
            path: None,
            max_age: 0,
            expires: None,
            secure: false,
            http_only: true,
        }
    }

    /// Renders the attributes as a `Set-Cookie`-ready cookie
    pub fn to_cookie(&self) -> Cookie<'static> {
        let mut builder = Cookie::build((self.name.clone(), self.value.clone()))
            .secure(self.secure)
            .http_only(self.http_only);

        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }
        if let Some(path) = &self.path {
            builder = builder.path(path.clone());
        }
        if self.max_age != 0 {
            builder = builder.max_age(time::Duration::seconds(self.max_age));
        }
        if let Some(expires) = self
            .expires
            .and_then(|at| OffsetDateTime::from_unix_timestamp(at.timestamp()).ok())
        {
            builder = builder.expires(expires);
        }

        builder.build()
    }
}

/// Session state for a single request
#[derive(Debug)]
pub struct Session {
    cookie: SessionCookie,
    data: SessionMap,
    keys: KeyRing,
    serializer: Serializer,
    /// Set by every operation that can change persisted state
    dirty: bool,
    /// The request carried a session cookie
    presented: bool,
}

impl Session {
    /// Creates an empty session using the default cookie name and serializer
    pub fn new(keys: KeyRing) -> Self {
        Self::with_parts(SessionCookie::new(DEFAULT_COOKIE_NAME), keys, Serializer::default())
    }

    pub fn with_parts(cookie: SessionCookie, keys: KeyRing, serializer: Serializer) -> Self {
        Self {
            cookie,
            data: SessionMap::new(),
            keys,
            serializer,
            dirty: false,
            presented: false,
        }
    }

    pub fn cookie(&self) -> &SessionCookie {
        &self.cookie
    }

    pub fn cookie_mut(&mut self) -> &mut SessionCookie {
        &mut self.cookie
    }

    /// The session ID when a store is configured (the raw cookie value otherwise)
    pub fn id(&self) -> &str {
        &self.cookie.value
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T>(&mut self, key: impl Into<String>, value: &T) -> SessionResult<()>
    where
        T: Serialize + ?Sized,
    {
        let value = self.serializer.to_plain(value)?;
        self.data.insert(key.into(), value);
        self.dirty = true;
        Ok(())
    }

    /// Stores a registered custom type under `key`, tagged with `T::TAG`.
    pub fn set_typed<T: SessionValue>(&mut self, key: impl Into<String>, value: &T) -> SessionResult<()> {
        let value = self.serializer.to_tagged(value)?;
        self.data.insert(key.into(), value);
        self.dirty = true;
        Ok(())
    }

    /// Reads the value under `key` as a `T`. Tagged values are unwrapped.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> SessionResult<Option<T>> {
        let Some(value) = self.data.get(key) else {
            return Ok(None);
        };
        let value = unwrap_envelope(value).map_or(value, |(_, inner)| inner);
        let decoded = serde_json::from_value(value.clone()).map_err(SerializeError::Decode)?;
        Ok(Some(decoded))
    }

    /// Reads a registered custom type, checking that the stored tag is `T::TAG`.
    pub fn get_typed<T: SessionValue>(&self, key: &str) -> SessionResult<Option<T>> {
        let Some(value) = self.data.get(key) else {
            return Ok(None);
        };
        match unwrap_envelope(value) {
            Some((tag, inner)) if tag == T::TAG => {
                let decoded = serde_json::from_value(inner.clone()).map_err(|source| {
                    SerializeError::InvalidValue {
                        tag: tag.to_string(),
                        source,
                    }
                })?;
                Ok(Some(decoded))
            }
            found => Err(SerializeError::TypeMismatch {
                key: key.to_string(),
                expected: T::TAG,
                found: found.map_or_else(|| "untagged".to_string(), |(tag, _)| tag.to_string()),
            }
            .into()),
        }
    }

    /// Raw stored value, tagged values still wrapped in their envelope
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Removes `key`. Marks the session dirty even when the key was absent.
    pub fn delete(&mut self, key: &str) {
        self.data.remove(key);
        self.dirty = true;
    }

    /// Removes every key but keeps the cookie alive
    pub fn clear(&mut self) {
        self.data.clear();
        self.dirty = true;
    }

    /// Drops all data and expires the cookie. The store entry, if any, is removed
    /// when the session is saved.
    pub fn destroy(&mut self) {
        self.data.clear();
        self.expire_cookie();
        self.dirty = true;
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_destroyed(&self) -> bool {
        self.cookie.max_age < 0
    }

    /// True when the request carried a session cookie
    pub fn was_presented(&self) -> bool {
        self.presented
    }

    /// Serializes and seals the session data with the current key.
    ///
    /// An empty session encodes to an empty buffer so that no cookie is emitted
    /// for sessions that were never populated.
    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }

        let key = self.keys.current().ok_or(CodecError::NoKeys)?;
        let plaintext = self.serializer.serialize(&self.data)?;
        Ok(codec::encrypt(&plaintext, key)?)
    }

    /// Opens and deserializes sealed session data, replacing the current data.
    /// Empty input is a no-op.
    pub fn decode(&mut self, data: &[u8]) -> SessionResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let plaintext = codec::decrypt(data, &self.keys)?;
        self.data = self.serializer.deserialize(&plaintext)?;
        Ok(())
    }

    pub(crate) fn mark_presented(&mut self, value: String) {
        self.cookie.value = value;
        self.presented = true;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn expire_cookie(&mut self) {
        self.cookie.max_age = -1;
        self.cookie.expires = Some(Utc::now());
    }
}

/// Shared, request-scoped access to the [`Session`].
///
/// The session middleware attaches one handle to the request extensions; cloning
/// the handle shares the same session rather than copying it. Handlers must not
/// keep a handle past the end of their request.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<Mutex<Session>>);

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    /// Attaches the handle to a request's extensions
    pub fn attach(&self, extensions: &mut Extensions) {
        extensions.insert(self.clone());
    }

    /// Retrieves the handle attached by the session middleware, if any
    pub fn from_extensions(extensions: &Extensions) -> Option<Self> {
        extensions.get::<Self>().cloned()
    }

    /// Locks the session. Do not hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        // A panicking handler cannot leave the map half-updated, so a poisoned
        // lock still guards a consistent session.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the session
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn set<T>(&self, key: impl Into<String>, value: &T) -> SessionResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.lock().set(key, value)
    }

    pub fn set_typed<T: SessionValue>(&self, key: impl Into<String>, value: &T) -> SessionResult<()> {
        self.lock().set_typed(key, value)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> SessionResult<Option<T>> {
        self.lock().get(key)
    }

    pub fn get_typed<T: SessionValue>(&self, key: &str) -> SessionResult<Option<T>> {
        self.lock().get_typed(key)
    }

    pub fn delete(&self, key: &str) {
        self.lock().delete(key)
    }

    pub fn destroy(&self) {
        self.lock().destroy()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().is_dirty()
    }
}
