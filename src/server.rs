//! WebSocket accept loop for the match coordinator.
//!
//! Each accepted TCP connection is upgraded on its own task and then driven
//! by [`run_session`] until it disconnects.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::connection::DEFAULT_OUTBOUND_CAPACITY;
use crate::coordinator::MatchCoordinator;
use crate::error::Result;
use crate::session::run_session;
use crate::transports::WebSocketTransport;

/// Per-connection tuning for [`MatchServer`].
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub outbound_capacity: usize,
    pub handshake_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Listening WebSocket endpoint for live matches.
#[derive(Debug)]
pub struct MatchServer {
    listener: TcpListener,
    coordinator: MatchCoordinator,
    settings: SessionSettings,
}

impl MatchServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`StackfallError::Io`](crate::StackfallError::Io) if the
    /// address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        coordinator: MatchCoordinator,
        settings: SessionSettings,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            coordinator,
            settings,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`StackfallError::Io`](crate::StackfallError::Io) if the socket
    /// address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running keep going on their own tasks.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) {
        let Self {
            listener,
            coordinator,
            settings,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "match server listening");
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("match server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    debug!(%peer, "connection accepted");
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        match WebSocketTransport::accept_with_timeout(tcp, settings.handshake_timeout).await {
                            Ok(transport) => {
                                run_session(transport, coordinator, settings.outbound_capacity).await;
                            }
                            Err(e) => warn!(%peer, "WebSocket handshake failed: {e}"),
                        }
                    });
                }
            }
        }
    }
}
