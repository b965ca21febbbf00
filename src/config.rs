//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::DEFAULT_OUTBOUND_CAPACITY;
use crate::error::{Result, StackfallError};
use crate::verifier::DEFAULT_MAX_STATE_BYTES;

/// Default listen address of the WebSocket match server.
pub const DEFAULT_WS_BIND: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 3536));

/// Default listen address of the run API.
pub const DEFAULT_HTTP_BIND: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 3537));

/// Default deadline for a WebSocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for both listeners.
///
/// # Example
///
/// ```
/// use stackfall_server::config::ServerConfig;
///
/// let config = ServerConfig::new("change-me")
///     .with_outbound_queue_capacity(512)
///     .with_max_state_bytes(20_000);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.outbound_queue_capacity, 512);
/// ```
#[derive(Clone)]
pub struct ServerConfig {
    /// Address of the WebSocket match server.
    pub ws_bind: SocketAddr,
    /// Address of the run API.
    pub http_bind: SocketAddr,
    /// HMAC secret for run tokens. Must not be empty.
    pub run_token_secret: String,
    /// Per-connection outbound queue capacity.
    ///
    /// A full queue drops the message with a warning instead of stalling the
    /// match. Defaults to **256**. Values below 1 are clamped to 1.
    pub outbound_queue_capacity: usize,
    /// Deadline for a new connection's WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Cap on a run's serialized initial state. Defaults to **50 000** bytes.
    pub max_state_bytes: usize,
    /// redb database file for runs. `None` keeps runs in memory only.
    pub store_path: Option<PathBuf>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("ws_bind", &self.ws_bind)
            .field("http_bind", &self.http_bind)
            .field("run_token_secret", &"<redacted>")
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_state_bytes", &self.max_state_bytes)
            .field("store_path", &self.store_path)
            .finish()
    }
}

impl ServerConfig {
    /// Defaults for everything but the secret.
    pub fn new(run_token_secret: impl Into<String>) -> Self {
        Self {
            ws_bind: DEFAULT_WS_BIND,
            http_bind: DEFAULT_HTTP_BIND,
            run_token_secret: run_token_secret.into(),
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_state_bytes: DEFAULT_MAX_STATE_BYTES,
            store_path: None,
        }
    }

    #[must_use]
    pub fn with_ws_bind(mut self, addr: SocketAddr) -> Self {
        self.ws_bind = addr;
        self
    }

    #[must_use]
    pub fn with_http_bind(mut self, addr: SocketAddr) -> Self {
        self.http_bind = addr;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_state_bytes(mut self, limit: usize) -> Self {
        self.max_state_bytes = limit;
        self
    }

    #[must_use]
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// # Errors
    ///
    /// [`StackfallError::Config`] if the secret is empty or both listeners
    /// share an address.
    pub fn validate(&self) -> Result<()> {
        if self.run_token_secret.is_empty() {
            return Err(StackfallError::Config(
                "run token secret must not be empty".to_string(),
            ));
        }
        if self.ws_bind == self.http_bind && self.ws_bind.port() != 0 {
            return Err(StackfallError::Config(format!(
                "WebSocket and HTTP listeners both bind {}",
                self.ws_bind
            )));
        }
        Ok(())
    }

    /// Per-connection settings for the match server.
    #[cfg(feature = "transport-websocket")]
    pub fn session_settings(&self) -> crate::server::SessionSettings {
        crate::server::SessionSettings {
            outbound_capacity: self.outbound_queue_capacity,
            handshake_timeout: self.handshake_timeout,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::new("s");
        assert_eq!(config.ws_bind.port(), 3536);
        assert_eq!(config.http_bind.port(), 3537);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.max_state_bytes, 50_000);
        assert!(config.store_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn capacity_is_clamped() {
        let config = ServerConfig::new("s").with_outbound_queue_capacity(0);
        assert_eq!(config.outbound_queue_capacity, 1);
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            ServerConfig::new("").validate(),
            Err(StackfallError::Config(_))
        ));
    }

    #[test]
    fn shared_address_is_rejected() {
        let config = ServerConfig::new("s").with_http_bind(DEFAULT_WS_BIND);
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", ServerConfig::new("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
