//! Client configuration.
//!
//! The endpoint URL and the per-request deadline are what the protocol needs;
//! the remaining knobs bound the transport so a stalled peer or an oversized
//! message cannot wedge the client. `from_env` reads them the same way the
//! rest of the tooling reads tunables: unparseable numbers fall back to defaults.

use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;
/// Same ceiling tungstenite applies to inbound messages by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing endpoint URL; set WSREQ_URL")]
    MissingUrl,
    #[error("invalid endpoint URL (expected ws:// or wss://): {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// How long a request waits for its response before failing with a timeout.
    pub request_timeout: Duration,
    /// Upper bound on a single connection attempt (TCP + TLS + handshake).
    pub connect_timeout: Duration,
    /// Upper bound on writing one frame. A write that stalls longer counts as
    /// a lost connection.
    pub send_timeout: Duration,
    /// Largest message, in bytes, accepted in either direction.
    pub max_message_size: usize,
}

impl ClientConfig {
    /// Build a config for `url` with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] unless the scheme is `ws` or `wss`.
    pub fn new(url: impl Into<String>) -> Result<Self, ConfigError> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self {
            url,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Build config from environment variables.
    ///
    /// Required:
    /// - `WSREQ_URL`
    ///
    /// Optional:
    /// - `WSREQ_REQUEST_TIMEOUT_MS`: default 5000
    /// - `WSREQ_CONNECT_TIMEOUT_MS`: default 10000
    /// - `WSREQ_SEND_TIMEOUT_MS`: default 10000
    /// - `WSREQ_MAX_MESSAGE_SIZE`: default 64 MiB
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUrl`] or [`ConfigError::InvalidUrl`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("WSREQ_URL").map_err(|_| ConfigError::MissingUrl)?;
        let config = Self::new(url)?
            .with_request_timeout(Duration::from_millis(env_parse(
                "WSREQ_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )))
            .with_connect_timeout(Duration::from_millis(env_parse(
                "WSREQ_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )))
            .with_send_timeout(Duration::from_millis(env_parse(
                "WSREQ_SEND_TIMEOUT_MS",
                DEFAULT_SEND_TIMEOUT_MS,
            )))
            .with_max_message_size(env_parse("WSREQ_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE));
        Ok(config)
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(ConfigError::InvalidUrl(url.to_owned()));
    };
    if !matches!(scheme, "ws" | "wss") || rest.is_empty() {
        return Err(ConfigError::InvalidUrl(url.to_owned()));
    }
    Ok(())
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
