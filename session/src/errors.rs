use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::codec::CodecError;
use crate::serializer::SerializeError;
use crate::store::SessionStoreError;

/// Session subsystem errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Invalid setup, e.g. no secret key. Raised before any request is served.
    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    /// A handler asked for the session but the session middleware is not installed
    #[error("No session attached to the request")]
    NotAttached,
}

impl SessionError {
    /// Short machine-readable category, used as a structured logging field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config",
            Self::Codec(CodecError::Authentication) => "authentication",
            Self::Codec(CodecError::Malformed(_)) => "malformed",
            Self::Codec(_) => "codec",
            Self::Serialize(_) => "decode",
            Self::Store(SessionStoreError::Timeout(_)) => "store_timeout",
            Self::Store(_) => "store",
            Self::NotAttached => "not_attached",
        }
    }

    /// True when the stored session itself is unusable (tampered, foreign key,
    /// corrupt structure), as opposed to infrastructure failures.
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self,
            Self::Codec(CodecError::Authentication | CodecError::Malformed(_))
                | Self::Serialize(_)
        )
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        // The body stays generic: clients must not learn whether a key or the
        // payload was at fault.
        error!(error = %self, kind = self.kind(), "Session error");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
