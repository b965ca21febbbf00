//! Connection identity and the fire-and-forget outbound queue.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Unique identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Sending half of a connection, owned by the match it sits in.
///
/// Delivery never blocks: a full queue drops the message with a warning, and
/// a closed queue (the session already exited) is ignored, since the
/// session's own disconnect path will clean the match up.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the session drains into its transport.
    ///
    /// Capacities below 1 are clamped to 1 (tokio panics on 0).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                tx,
            },
            rx,
        )
    }

    /// This connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue `message` for this connection. Returns `true` if it was queued.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    connection = %self.id,
                    "outbound queue full, dropping message: {:?}",
                    std::mem::discriminant(&dropped)
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = %self.id, "outbound queue closed, peer gone");
                false
            }
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
    fn handles_get_distinct_ids() {
        let (a, _ra) = ConnectionHandle::channel(4);
        let (b, _rb) = ConnectionHandle::channel(4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (handle, mut rx) = ConnectionHandle::channel(1);
        assert!(handle.deliver(ServerMessage::Garbage { count: 1 }));
        assert!(!handle.deliver(ServerMessage::Garbage { count: 2 }));
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Garbage { count: 1 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_ignored() {
        let (handle, rx) = ConnectionHandle::channel(4);
        drop(rx);
        assert!(!handle.deliver(ServerMessage::OpponentLeft {}));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (handle, mut rx) = ConnectionHandle::channel(0);
        assert!(handle.deliver(ServerMessage::OpponentFinished {}));
        assert!(rx.try_recv().is_ok());
    }
}
