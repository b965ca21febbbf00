//! Transport abstraction for the live match channel.
//!
//! The [`Transport`] trait is one accepted client connection seen from the
//! server: a bidirectional channel of complete JSON text messages. Framing
//! (WebSocket frames, length prefixes, ...) is the implementation's concern.
//!
//! Accepting connections is NOT part of this trait. Listeners differ per
//! transport; accept a connection externally, wrap it, and hand it to
//! [`run_session`](crate::session::run_session).

use async_trait::async_trait;

use crate::error::StackfallError;

/// A bidirectional text message transport for one client connection.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON
/// message; each call to [`recv`](Transport::recv) yields one.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe: the session loop
/// polls it inside `tokio::select!` next to the outbound queue. If `recv` is
/// cancelled before completion, calling it again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the client.
    ///
    /// # Errors
    ///
    /// Returns [`StackfallError::TransportSend`] if the message could not be
    /// written, or [`StackfallError::TransportClosed`] after `close`.
    async fn send(&mut self, message: String) -> Result<(), StackfallError>;

    /// Receive the next JSON text message from the client.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the client closed the connection
    async fn recv(&mut self) -> Option<Result<String, StackfallError>>;

    /// Close the connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), StackfallError>;
}
