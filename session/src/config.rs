use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SessionError, SessionResult};

/// Default name of the session cookie
pub const DEFAULT_COOKIE_NAME: &str = "hs";
/// Default session lifetime: one day
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// What to do when an incoming session cannot be decoded or authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Reject the request with a 500 response
    #[default]
    Reject,
    /// Log the failure and continue with a fresh, empty session
    Reset,
}

/// Session middleware configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session cookie
    pub cookie_name: String,
    /// Cookie `Domain` attribute, omitted when `None`
    pub domain: Option<String>,
    /// Cookie `Path` attribute, omitted when `None`
    pub path: Option<String>,
    /// Session lifetime, rendered as the cookie `Max-Age` and `Expires`
    pub max_age_secs: u64,
    /// Secrets used to derive encryption keys. The first one encrypts; the rest
    /// are retired keys still accepted on decrypt.
    pub secret_keys: Vec<String>,
    /// Always mark the cookie `Secure`. HTTP/1.1 requests rarely carry a scheme,
    /// so this is the dependable switch for https deployments.
    pub secure: bool,
    /// Mark the cookie `Secure` when `X-Forwarded-Proto: https` is present. Only
    /// enable behind a proxy that sets the header itself.
    pub trust_forwarded_proto: bool,
    /// Upper bound for a single store call, no limit when `None`
    pub store_timeout_secs: Option<u64>,
    pub on_decode_failure: DecodeFailurePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            domain: None,
            path: Some("/".to_string()),
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            secret_keys: Vec::new(),
            secure: false,
            trust_forwarded_proto: false,
            store_timeout_secs: None,
            on_decode_failure: DecodeFailurePolicy::Reject,
        }
    }
}

// Manual Debug implementation so secrets never end up in logs
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("cookie_name", &self.cookie_name)
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("max_age_secs", &self.max_age_secs)
            .field("secret_keys", &format_args!("[{} redacted]", self.secret_keys.len()))
            .field("secure", &self.secure)
            .field("trust_forwarded_proto", &self.trust_forwarded_proto)
            .field("store_timeout_secs", &self.store_timeout_secs)
            .field("on_decode_failure", &self.on_decode_failure)
            .finish()
    }
}

impl SessionConfig {
    /// Creates a default configuration using the given secrets, leftmost first
    pub fn with_secret_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            secret_keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Loads configuration from a file if it exists, otherwise returns the default config
    pub fn load_from_file(path: &Path) -> SessionResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| SessionError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| SessionError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// Checks the settings that cannot be defaulted
    pub fn validate(&self) -> SessionResult<()> {
        if self.secret_keys.is_empty() {
            return Err(SessionError::ConfigError(
                "at least one secret key is required".to_string(),
            ));
        }
        if self.secret_keys.iter().any(|k| k.is_empty()) {
            return Err(SessionError::ConfigError("secret keys must not be empty".to_string()));
        }
        if self.cookie_name.is_empty() {
            return Err(SessionError::ConfigError("cookie name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_secs.map(Duration::from_secs)
    }
}
