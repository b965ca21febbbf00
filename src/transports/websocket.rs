//! Server-side WebSocket transport using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] wraps one accepted WebSocket connection and
//! translates between the match protocol's text messages and WebSocket
//! frames.
//!
//! # Feature gate
//!
//! Only available with the `transport-websocket` feature (enabled by default).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::StackfallError;
use crate::transport::Transport;

/// The underlying accepted WebSocket stream.
pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A [`Transport`] backed by an accepted WebSocket connection.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe: dropping its future before it
/// completes does not consume or lose any frame.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake on a freshly accepted TCP stream.
    ///
    /// # Errors
    ///
    /// Returns [`StackfallError::Io`] if the handshake fails. When the
    /// underlying error is an I/O error its kind is preserved.
    pub async fn accept(tcp: TcpStream) -> Result<Self, StackfallError> {
        let peer = tcp.peer_addr().ok();
        let stream = tokio_tungstenite::accept_async(tcp).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            StackfallError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::debug!(?peer, "WebSocket handshake completed");

        Ok(Self::from_stream(stream))
    }

    /// Like [`accept`](Self::accept), but fails with
    /// [`StackfallError::Timeout`] if the handshake does not finish in time.
    ///
    /// # Errors
    ///
    /// Returns [`StackfallError::Timeout`] if the deadline elapses, or any
    /// error [`accept`](Self::accept) may return.
    pub async fn accept_with_timeout(
        tcp: TcpStream,
        timeout: Duration,
    ) -> Result<Self, StackfallError> {
        tokio::time::timeout(timeout, Self::accept(tcp))
            .await
            .map_err(|_| StackfallError::Timeout)?
    }

    /// Wrap a stream whose handshake was already performed elsewhere.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), StackfallError> {
        if self.closed {
            return Err(StackfallError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| StackfallError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, StackfallError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(StackfallError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), StackfallError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| StackfallError::TransportSend(e.to_string()))
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
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    /// Bind a local listener and connect a plain client to it. Returns the
    /// server-side transport and the raw client stream.
    async fn connected_pair() -> (
        WebSocketTransport,
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            WebSocketTransport::accept(tcp).await.unwrap()
        });

        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn recv_receives_text_messages() {
        let (mut transport, mut client) = connected_pair().await;

        client.send(Message::Text("hello".into())).await.unwrap();
        client.send(Message::Text("world".into())).await.unwrap();

        assert_eq!(transport.recv().await.unwrap().unwrap(), "hello");
        assert_eq!(transport.recv().await.unwrap().unwrap(), "world");
    }

    #[tokio::test]
    async fn recv_returns_none_on_close_frame() {
        let (mut transport, mut client) = connected_pair().await;
        client.close(None).await.unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_skips_binary_frames() {
        let (mut transport, mut client) = connected_pair().await;

        client
            .send(Message::Binary(vec![0xDE, 0xAD].into()))
            .await
            .unwrap();
        client
            .send(Message::Text("after_binary".into()))
            .await
            .unwrap();

        assert_eq!(transport.recv().await.unwrap().unwrap(), "after_binary");
    }

    #[tokio::test]
    async fn send_reaches_client() {
        let (mut transport, mut client) = connected_pair().await;
        transport.send("garbage".to_string()).await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "garbage"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let (mut transport, _client) = connected_pair().await;
        transport.close().await.unwrap();

        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, StackfallError::TransportClosed));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let (mut transport, _client) = connected_pair().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn accept_fails_on_non_websocket_peer() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            tcp.write_all(b"not a handshake\r\n\r\n").await.unwrap();
            tcp
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let result = WebSocketTransport::accept(tcp).await;
        assert!(matches!(result, Err(StackfallError::Io(_))));
        drop(client);
    }
}
