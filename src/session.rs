//! Per-connection session: the bridge between a [`Transport`] and the
//! [`MatchCoordinator`].
//!
//! [`run_session`] multiplexes two sources with `tokio::select!`: inbound
//! text from the client, which is parsed and dispatched, and the
//! connection's outbound queue, which is serialized onto the transport. When
//! either side fails or the client closes, the connection leaves its match
//! and the transport is closed.

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::coordinator::{JoinRequest, MatchCoordinator};
use crate::error::Result;
use crate::protocol::{ClientMessage, MatchId, ServerMessage};
use crate::transport::Transport;

/// Parse one inbound text frame.
///
/// # Errors
///
/// [`StackfallError::Serialization`](crate::StackfallError::Serialization)
/// if the text is not a known client message.
pub fn decode(text: &str) -> Result<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Encode one outbound message as a text frame.
///
/// # Errors
///
/// [`StackfallError::Serialization`](crate::StackfallError::Serialization)
/// if the message cannot be encoded.
pub fn encode(message: &ServerMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Match-facing state of one connection.
///
/// Holds only the id of the bound match, never the match itself.
#[derive(Debug)]
pub struct Session {
    handle: ConnectionHandle,
    coordinator: MatchCoordinator,
    match_id: Option<MatchId>,
}

impl Session {
    /// Create a session plus the outbound receiver to drain into the transport.
    pub fn new(
        coordinator: MatchCoordinator,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (handle, outbound) = ConnectionHandle::channel(outbound_capacity);
        (
            Self {
                handle,
                coordinator,
                match_id: None,
            },
            outbound,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Id of the match this connection is in, if any.
    pub fn match_id(&self) -> Option<&str> {
        self.match_id.as_deref()
    }

    /// Parse and dispatch one inbound text message. Malformed input is
    /// logged and dropped.
    pub async fn handle_text(&mut self, text: &str) {
        match decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                warn!(connection = %self.handle.id(), "dropping malformed client message: {e}");
            }
        }
    }

    /// Apply one inbound message. Gameplay messages sent before a join are
    /// ignored.
    pub async fn dispatch(&mut self, message: ClientMessage) {
        let from = self.handle.id();
        match message {
            ClientMessage::JoinMatch {
                match_id,
                user_id,
                pseudo,
                mode,
            } => {
                self.leave().await;
                let seat = self
                    .coordinator
                    .join(
                        &self.handle,
                        JoinRequest {
                            match_id,
                            user_id,
                            pseudo,
                            mode,
                        },
                    )
                    .await;
                debug!(connection = %from, match_id = %seat.match_id, slot = seat.slot, "joined");
                self.match_id = Some(seat.match_id);
            }
            other => {
                let Some(match_id) = self.match_id.as_deref() else {
                    debug!(connection = %from, "message before join, ignoring");
                    return;
                };
                let coordinator = &self.coordinator;
                match other {
                    ClientMessage::LinesCleared { lines } => {
                        coordinator.lines_cleared(match_id, from, lines).await;
                    }
                    ClientMessage::State { board } => {
                        coordinator.board_state(match_id, from, board).await;
                    }
                    ClientMessage::GameOver { score, lines } => {
                        coordinator.game_over(match_id, from, score, lines).await;
                    }
                    ClientMessage::RvEffect { effect } => {
                        coordinator.effect(match_id, from, effect).await;
                    }
                    ClientMessage::RvStatus { status } => {
                        coordinator.status(match_id, from, status).await;
                    }
                    ClientMessage::JoinMatch { .. } => {}
                }
            }
        }
    }

    /// Leave the bound match, if any.
    pub async fn leave(&mut self) {
        if let Some(match_id) = self.match_id.take() {
            self.coordinator.leave(&match_id, self.handle.id()).await;
        }
    }
}

/// Drive one connection until the client disconnects or the transport fails.
///
/// A dropped connection is a permanent departure: the match is left and
/// there is no resume.
pub async fn run_session(
    mut transport: impl Transport,
    coordinator: MatchCoordinator,
    outbound_capacity: usize,
) {
    let (mut session, mut outbound) = Session::new(coordinator, outbound_capacity);
    let connection = session.connection_id();
    debug!(%connection, "session started");

    loop {
        tokio::select! {
            // Branch 1: outbound event for this client. The session holds a
            // sender, so the queue never closes while the loop runs.
            Some(message) = outbound.recv() => {
                match encode(&message) {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            warn!(%connection, "transport send error: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(%connection, "failed to serialize ServerMessage: {e}");
                    }
                }
            }

            // Branch 2: inbound message from the client.
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => session.handle_text(&text).await,
                    Some(Err(e)) => {
                        warn!(%connection, "transport receive error: {e}");
                        break;
                    }
                    None => {
                        debug!(%connection, "client closed connection");
                        break;
                    }
                }
            }
        }
    }

    session.leave().await;
    let _ = transport.close().await;
    debug!(%connection, "session ended");
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

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn codec_errors_are_serialization_errors() {
        assert!(matches!(
            decode("{not json"),
            Err(crate::StackfallError::Serialization(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"leave_match","data":{}}"#),
            Err(crate::StackfallError::Serialization(_))
        ));
        let text = encode(&ServerMessage::Garbage { count: 2 }).unwrap();
        assert_eq!(text, r#"{"type":"garbage","data":{"count":2}}"#);
    }

    #[tokio::test]
    async fn malformed_text_is_dropped() {
        let (mut session, mut rx) = Session::new(MatchCoordinator::new(), 16);
        session.handle_text("{not json").await;
        session.handle_text(r#"{"type":"teleport","data":{}}"#).await;
        assert!(session.match_id().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn gameplay_before_join_is_ignored() {
        let coordinator = MatchCoordinator::new();
        let (mut session, mut rx) = Session::new(coordinator.clone(), 16);
        session
            .handle_text(r#"{"type":"lines_cleared","data":{"lines":4}}"#)
            .await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(coordinator.match_count().await, 0);
    }

    #[tokio::test]
    async fn rejoin_leaves_the_previous_match() {
        let coordinator = MatchCoordinator::new();
        let (mut session, _rx) = Session::new(coordinator.clone(), 64);

        session
            .handle_text(r#"{"type":"join_match","data":{"matchId":"first"}}"#)
            .await;
        session
            .handle_text(r#"{"type":"join_match","data":{"matchId":"second"}}"#)
            .await;

        assert_eq!(session.match_id(), Some("second"));
        assert!(coordinator.snapshot("first").await.is_none());
        assert_eq!(coordinator.match_count().await, 1);
    }

    #[tokio::test]
    async fn leave_match_frame_is_dropped() {
        let coordinator = MatchCoordinator::new();
        let (mut session, _rx) = Session::new(coordinator.clone(), 64);
        session
            .handle_text(r#"{"type":"join_match","data":{"matchId":"solo"}}"#)
            .await;
        session
            .handle_text(r#"{"type":"leave_match","data":{}}"#)
            .await;
        // Only a disconnect or another join leaves a match.
        assert_eq!(session.match_id(), Some("solo"));
        assert_eq!(coordinator.match_count().await, 1);
    }
}
