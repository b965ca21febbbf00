#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Stackfall server integration tests.
//!
//! Provides a channel-driven [`MockTransport`] whose other end is a
//! [`MockClient`] the test drives like a real game client, plus helpers for
//! building run API requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stackfall_server::connection::DEFAULT_OUTBOUND_CAPACITY;
use stackfall_server::protocol::{ClientMessage, MatchMode, ServerMessage};
use stackfall_server::session::run_session;
use stackfall_server::{MatchCoordinator, StackfallError, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a test waits for an expected server message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ── MockTransport ───────────────────────────────────────────────────

/// Server side of an in-process connection.
///
/// `recv()` yields whatever the paired [`MockClient`] pushes and returns
/// `None` once the client is dropped or disconnects. Everything the server
/// sends is forwarded to the client.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Result<String, StackfallError>>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Test-driven client end of a [`MockTransport`].
pub struct MockClient {
    to_server: Option<mpsc::UnboundedSender<Result<String, StackfallError>>>,
    from_server: mpsc::UnboundedReceiver<String>,
    /// Whether the server called `close()` on its transport.
    pub closed: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a connected transport/client pair.
    pub fn pair() -> (Self, MockClient) {
        let (to_server, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_server) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Self {
            incoming,
            outgoing,
            closed: Arc::clone(&closed),
        };
        let client = MockClient {
            to_server: Some(to_server),
            from_server,
            closed,
        };
        (transport, client)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), StackfallError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StackfallError::TransportClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|e| StackfallError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, StackfallError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<(), StackfallError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl MockClient {
    /// Send a typed client message.
    pub fn send(&self, message: &ClientMessage) {
        self.send_raw(&serde_json::to_string(message).expect("serialize ClientMessage"));
    }

    /// Send raw text, malformed or not.
    pub fn send_raw(&self, text: &str) {
        self.to_server
            .as_ref()
            .expect("client already disconnected")
            .send(Ok(text.to_string()))
            .expect("session gone");
    }

    /// Inject a transport-level receive error.
    pub fn fail(&self, reason: &str) {
        self.to_server
            .as_ref()
            .expect("client already disconnected")
            .send(Err(StackfallError::TransportReceive(reason.to_string())))
            .expect("session gone");
    }

    /// Close the client side; the session sees end-of-stream.
    pub fn disconnect(&mut self) {
        self.to_server = None;
    }

    /// Next server message, failing the test after [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> ServerMessage {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.from_server.recv())
            .await
            .expect("timed out waiting for server message")
            .expect("server closed the connection");
        serde_json::from_str(&text).expect("server sent invalid JSON")
    }

    /// Skip messages until one satisfies `pred`.
    pub async fn recv_until(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn assert_silent(&mut self) {
        let waited =
            tokio::time::timeout(Duration::from_millis(100), self.from_server.recv()).await;
        if let Ok(Some(text)) = waited {
            panic!("expected silence, got {text}");
        }
    }

    /// Every message already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_server.try_recv() {
            out.push(serde_json::from_str(&text).expect("server sent invalid JSON"));
        }
        out
    }
}

/// Spawn a session for a new mock connection.
pub fn connect(coordinator: &MatchCoordinator) -> (MockClient, JoinHandle<()>) {
    let (transport, client) = MockTransport::pair();
    let task = tokio::spawn(run_session(
        transport,
        coordinator.clone(),
        DEFAULT_OUTBOUND_CAPACITY,
    ));
    (client, task)
}

// ── Message helpers ─────────────────────────────────────────────────

/// `join_match` for an explicit id in standard mode.
pub fn join(match_id: &str) -> ClientMessage {
    ClientMessage::JoinMatch {
        match_id: Some(match_id.to_string()),
        user_id: None,
        pseudo: None,
        mode: MatchMode::StandardVersus,
    }
}

/// `join_match` with every optional field set.
pub fn join_as(match_id: &str, user_id: u64, pseudo: &str, mode: MatchMode) -> ClientMessage {
    ClientMessage::JoinMatch {
        match_id: Some(match_id.to_string()),
        user_id: Some(user_id),
        pseudo: Some(pseudo.to_string()),
        mode,
    }
}

pub fn is_start(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::Start { .. })
}

pub fn is_match_over(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::MatchOver { .. })
}
