//! Session middleware for axum.
//!
//! [`SessionManager`] holds the process-wide session settings (key ring,
//! serializer, optional store) and implements the request lifecycle:
//!
//! 1. resolve the session cookie, or start a fresh session,
//! 2. load and open the sealed data (from the cookie or the store),
//! 3. attach a [`SessionHandle`] to the request extensions,
//! 4. run the wrapped handler,
//! 5. save the session if it was mutated and attach the `Set-Cookie` header.
//!
//! The response head is produced exactly once, when the inner service resolves,
//! and nothing reaches the client before this middleware returns it. Saving at
//! that point therefore happens once per request, before the first byte is
//! written, whatever the handler does with the body.
//!
//! ```no_run
//! use axum::{middleware, routing::get, Router};
//! use hs_session::{manage_sessions, SessionConfig, SessionHandle, SessionManager};
//!
//! async fn hello(session: SessionHandle) -> String {
//!     let name: Option<String> = session.get("name").unwrap_or_default();
//!     format!("Hello {}!", name.unwrap_or_else(|| "stranger".to_string()))
//! }
//!
//! # fn build() -> Result<Router, hs_session::SessionError> {
//! let manager = SessionManager::new(SessionConfig::with_secret_keys(["secret"]), None)?;
//! let app: Router = Router::new()
//!     .route("/", get(hello))
//!     .layer(middleware::from_fn_with_state(manager, manage_sessions));
//! # Ok(app)
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use cookie::Cookie;
use tracing::{debug, error, warn};

use crate::codec::{self, CodecError, KeyRing};
use crate::config::{DecodeFailurePolicy, SessionConfig};
use crate::errors::{SessionError, SessionResult};
use crate::serializer::{Serializer, TypeRegistry};
use crate::session::{generate_session_id, is_session_id, Session, SessionCookie, SessionHandle};
use crate::store::{SessionStoreError, SessionStoreRef};

/// Browsers commonly drop cookies larger than this
const MAX_COOKIE_SIZE: usize = 4096;
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

struct Inner {
    config: SessionConfig,
    keys: KeyRing,
    serializer: Serializer,
    store: Option<SessionStoreRef>,
}

/// Process-wide session settings shared by every request.
///
/// Cheap to clone; read-only once constructed.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// What the save step has to do once the session lock is released
enum SavePlan {
    Skip,
    Cookie(Cookie<'static>),
    Persist {
        store: SessionStoreRef,
        id: String,
        blob: Vec<u8>,
        cookie: Cookie<'static>,
    },
    Destroy {
        store: Option<SessionStoreRef>,
        id: String,
        cookie: Cookie<'static>,
    },
}

impl SessionManager {
    /// Creates a manager without custom session value types.
    ///
    /// Fails when the configuration carries no secret key. `store` switches from
    /// cookie-held data to store-held data keyed by a random session ID.
    pub fn new(config: SessionConfig, store: Option<SessionStoreRef>) -> SessionResult<Self> {
        Self::with_registry(config, store, TypeRegistry::new())
    }

    /// Creates a manager whose sessions may hold the types in `registry`.
    pub fn with_registry(
        config: SessionConfig,
        store: Option<SessionStoreRef>,
        registry: TypeRegistry,
    ) -> SessionResult<Self> {
        config.validate()?;
        let keys = KeyRing::from_secrets(&config.secret_keys)?;

        debug!(
            cookie = %config.cookie_name,
            keys = keys.len(),
            custom_types = registry.len(),
            external_store = store.is_some(),
            "Session manager configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                keys,
                serializer: Serializer::new(registry),
                store,
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn keys(&self) -> &KeyRing {
        &self.inner.keys
    }

    pub fn serializer(&self) -> &Serializer {
        &self.inner.serializer
    }

    pub fn store(&self) -> Option<&SessionStoreRef> {
        self.inner.store.as_ref()
    }

    /// A fresh session carrying the configured cookie attributes. With a store,
    /// the cookie value is a new random session ID.
    pub fn new_session(&self, secure: bool) -> Session {
        let config = &self.inner.config;
        let max_age = i64::try_from(config.max_age_secs).unwrap_or(i64::MAX);

        let mut cookie = SessionCookie::new(config.cookie_name.clone());
        cookie.domain = config.domain.clone();
        cookie.path = config.path.clone();
        cookie.secure = secure || config.secure;
        if max_age > 0 {
            cookie.max_age = max_age;
            cookie.expires = chrono::Duration::try_seconds(max_age)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        }
        if self.inner.store.is_some() {
            cookie.value = generate_session_id();
        }

        Session::with_parts(cookie, self.inner.keys.clone(), self.inner.serializer.clone())
    }

    /// Builds the session for a request from the session cookie value, if any.
    ///
    /// In store mode only well-formed IDs with a stored entry are adopted. Any
    /// other presented ID is replaced by the fresh one, so a client can never pick
    /// the ID its session is saved under.
    pub async fn load(&self, cookie_value: Option<&str>, secure: bool) -> SessionResult<Session> {
        let mut session = self.new_session(secure);
        let Some(value) = cookie_value.filter(|v| !v.is_empty()) else {
            return Ok(session);
        };

        let data = match &self.inner.store {
            Some(store) => {
                let stored = if is_session_id(value) {
                    match self.with_timeout("load", store.load(value)).await {
                        Ok(data) => Some(data),
                        Err(SessionStoreError::NotFound(_)) => None,
                        Err(e) => return Err(e.into()),
                    }
                } else {
                    None
                };

                match stored {
                    Some(data) => {
                        session.mark_presented(value.to_string());
                        data
                    }
                    None => {
                        debug!("Unknown session ID, issuing a fresh one");
                        let fresh = session.id().to_string();
                        session.mark_presented(fresh);
                        Vec::new()
                    }
                }
            }
            None => {
                session.mark_presented(value.to_string());
                codec::from_cookie_value(value)?
            }
        };

        session.decode(&data)?;
        Ok(session)
    }

    /// Replacement session used by [`DecodeFailurePolicy::Reset`]. It is dirty so
    /// that the rejected cookie gets overwritten or expired on save. In store mode
    /// the entry under the rejected ID is destroyed.
    pub async fn reset_session(&self, rejected: Option<&str>, secure: bool) -> Session {
        if let (Some(store), Some(id)) = (&self.inner.store, rejected.filter(|id| is_session_id(id))) {
            if let Err(e) = self.with_timeout("destroy", store.destroy(id)).await {
                warn!(error = %e, kind = "store", "Failed to destroy rejected session");
            }
        }

        let mut session = self.new_session(secure);
        let id = session.id().to_string();
        session.mark_presented(id);
        session.mark_dirty();
        session
    }

    /// Persists the session if it changed. Returns the cookie to send, if any.
    pub async fn save(&self, handle: &SessionHandle) -> SessionResult<Option<Cookie<'static>>> {
        // The lock is released before any store call is awaited.
        let plan = handle.with(|session| self.plan_save(session))?;

        match plan {
            SavePlan::Skip => Ok(None),
            SavePlan::Cookie(cookie) => Ok(Some(cookie)),
            SavePlan::Persist {
                store,
                id,
                blob,
                cookie,
            } => {
                self.with_timeout("save", store.save(&id, &blob)).await?;
                Ok(Some(cookie))
            }
            SavePlan::Destroy { store, id, cookie } => {
                if let Some(store) = store {
                    self.with_timeout("destroy", store.destroy(&id)).await?;
                }
                Ok(Some(cookie))
            }
        }
    }

    fn plan_save(&self, session: &mut Session) -> SessionResult<SavePlan> {
        if !session.is_dirty() {
            return Ok(SavePlan::Skip);
        }

        if !session.is_destroyed() {
            let blob = session.encode()?;
            if !blob.is_empty() {
                return Ok(match &self.inner.store {
                    Some(store) => SavePlan::Persist {
                        store: Arc::clone(store),
                        id: session.id().to_string(),
                        blob,
                        cookie: session.cookie().to_cookie(),
                    },
                    None => {
                        session.cookie_mut().value = codec::to_cookie_value(&blob);
                        let cookie = session.cookie().to_cookie();
                        log_cookie_size(&cookie);
                        SavePlan::Cookie(cookie)
                    }
                });
            }

            // Nothing left to persist. A session the browser never had needs no
            // cookie; one it does have must be expired.
            if !session.was_presented() {
                return Ok(SavePlan::Skip);
            }
            session.expire_cookie();
        }

        let id = session.id().to_string();
        if self.inner.store.is_none() {
            session.cookie_mut().value.clear();
        }
        Ok(SavePlan::Destroy {
            store: self.inner.store.clone(),
            id,
            cookie: session.cookie().to_cookie(),
        })
    }

    async fn with_timeout<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, SessionStoreError>>,
    ) -> Result<T, SessionStoreError> {
        match self.inner.config.store_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| SessionStoreError::Timeout(op))?,
            None => fut.await,
        }
    }
}

fn log_cookie_size(cookie: &Cookie<'_>) {
    let size = cookie.name().len() + cookie.value().len();
    if size > MAX_COOKIE_SIZE {
        warn!(size, limit = MAX_COOKIE_SIZE, "Session cookie exceeds browser size limit");
    } else {
        debug!(size, "Session cookie size");
    }
}

/// Value of the cookie called `name` in the request `Cookie` headers
fn request_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

/// Whether the request reached the server over https. Origin-form HTTP/1.1
/// targets carry no scheme, so behind a TLS terminating proxy this relies on
/// `X-Forwarded-Proto`, honoured only when `trust_forwarded_proto` is set.
/// `SessionConfig::secure` forces the flag regardless.
fn is_secure_request<B>(request: &Request<B>, config: &SessionConfig) -> bool {
    if request.uri().scheme_str() == Some("https") {
        return true;
    }
    config.trust_forwarded_proto
        && request
            .headers()
            .get(X_FORWARDED_PROTO)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn log_load_failure(e: &SessionError) {
    match e {
        SessionError::Codec(CodecError::Authentication) => {
            warn!(kind = e.kind(), "Session failed authentication with every configured key")
        }
        _ if e.is_decode_failure() => warn!(error = %e, kind = e.kind(), "Malformed session data"),
        _ => error!(error = %e, kind = e.kind(), "Failed to load session"),
    }
}

/// axum middleware loading the session before, and saving it after, the wrapped
/// handler. Install with `axum::middleware::from_fn_with_state(manager, manage_sessions)`.
pub async fn manage_sessions<B>(
    State(manager): State<SessionManager>,
    mut request: Request<B>,
    next: Next<B>,
) -> Response
where
    B: Send,
{
    let secure = is_secure_request(&request, manager.config());
    let cookie_value = request_cookie(request.headers(), &manager.config().cookie_name);

    let session = match manager.load(cookie_value.as_deref(), secure).await {
        Ok(session) => session,
        Err(e) => {
            log_load_failure(&e);
            match manager.config().on_decode_failure {
                DecodeFailurePolicy::Reset if e.is_decode_failure() => {
                    manager.reset_session(cookie_value.as_deref(), secure).await
                }
                _ => return e.into_response(),
            }
        }
    };

    let handle = SessionHandle::new(session);
    handle.attach(request.extensions_mut());

    let mut response = next.run(request).await;

    match manager.save(&handle).await {
        Ok(Some(cookie)) => match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => error!(error = %e, "Session cookie is not a valid header value"),
        },
        Ok(None) => {}
        // The response is already built; a failed save must not replace it.
        Err(e) => error!(error = %e, kind = e.kind(), "Failed to save session"),
    }

    response
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = SessionError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        SessionHandle::from_extensions(&parts.extensions).ok_or(SessionError::NotAttached)
    }
}
