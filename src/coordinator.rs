//! Global match table and the message-driven match operations.
//!
//! [`MatchCoordinator`] is a cheap-to-clone handle over a map from match id
//! to a per-match lock. Lock order is always table, then match: `join` and
//! `leave` hold both so a match cannot be removed while someone attaches to
//! it, while gameplay operations release the table before touching the
//! match.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::matches::{Match, MatchSnapshot};
use crate::protocol::{MatchId, MatchMode, Slot, UserId};

/// Parameters of a `join_match` request.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// Match to attach to. `None` (or empty) always creates a new match.
    pub match_id: Option<MatchId>,
    pub user_id: Option<UserId>,
    pub pseudo: Option<String>,
    /// Only used when the match is created by this request.
    pub mode: MatchMode,
}

impl JoinRequest {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_match_id(mut self, match_id: impl Into<MatchId>) -> Self {
        self.match_id = Some(match_id.into());
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_pseudo(mut self, pseudo: impl Into<String>) -> Self {
        self.pseudo = Some(pseudo.into());
        self
    }
}

/// Where a connection landed after `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seat {
    pub match_id: MatchId,
    pub slot: Slot,
}

type MatchTable = HashMap<MatchId, Arc<Mutex<Match>>>;

/// Owner of every live match in the process.
#[derive(Debug, Clone, Default)]
pub struct MatchCoordinator {
    matches: Arc<Mutex<MatchTable>>,
}

impl MatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seat `handle` in the requested match, creating it if needed.
    pub async fn join(&self, handle: &ConnectionHandle, request: JoinRequest) -> Seat {
        let match_id = request
            .match_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut table = self.matches.lock().await;
        let entry = table.entry(match_id.clone()).or_insert_with(|| {
            info!(%match_id, mode = ?request.mode, "match created");
            Arc::new(Mutex::new(Match::new(match_id.clone(), request.mode)))
        });
        let slot = entry
            .lock()
            .await
            .join(handle.clone(), request.user_id, request.pseudo);
        Seat { match_id, slot }
    }

    /// Remove `connection` from a match, deleting the match once empty.
    pub async fn leave(&self, match_id: &str, connection: ConnectionId) {
        let mut table = self.matches.lock().await;
        let Some(entry) = table.get(match_id) else {
            return;
        };
        let now_empty = {
            let mut m = entry.lock().await;
            m.leave(connection);
            m.is_empty()
        };
        if now_empty {
            table.remove(match_id);
            info!(%match_id, "match closed");
        }
    }

    pub async fn lines_cleared(&self, match_id: &str, from: ConnectionId, lines: i64) {
        self.with_match(match_id, from, |m| m.lines_cleared(from, lines))
            .await;
    }

    pub async fn board_state(&self, match_id: &str, from: ConnectionId, board: serde_json::Value) {
        self.with_match(match_id, from, |m| m.board_state(from, board))
            .await;
    }

    pub async fn effect(&self, match_id: &str, from: ConnectionId, effect: serde_json::Value) {
        self.with_match(match_id, from, |m| m.effect(from, effect))
            .await;
    }

    pub async fn status(&self, match_id: &str, from: ConnectionId, status: serde_json::Value) {
        self.with_match(match_id, from, |m| m.status(from, status))
            .await;
    }

    pub async fn game_over(&self, match_id: &str, from: ConnectionId, score: u64, lines: u64) {
        self.with_match(match_id, from, |m| m.game_over(from, score, lines))
            .await;
    }

    /// Read-only view of a live match.
    pub async fn snapshot(&self, match_id: &str) -> Option<MatchSnapshot> {
        let entry = self.matches.lock().await.get(match_id).cloned()?;
        let snapshot = entry.lock().await.snapshot();
        Some(snapshot)
    }

    /// Number of live matches.
    pub async fn match_count(&self) -> usize {
        self.matches.lock().await.len()
    }

    /// Run `op` under the match's lock if `from` is seated in it.
    async fn with_match<F>(&self, match_id: &str, from: ConnectionId, op: F)
    where
        F: FnOnce(&mut Match),
    {
        let Some(entry) = self.matches.lock().await.get(match_id).cloned() else {
            debug!(%match_id, connection = %from, "message for unknown match, ignoring");
            return;
        };
        let mut m = entry.lock().await;
        if !m.contains(from) {
            debug!(%match_id, connection = %from, "message from non-participant, ignoring");
            return;
        }
        op(&mut m);
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
    use crate::matches::MatchPhase;

    #[tokio::test]
    async fn joins_without_id_create_distinct_matches() {
        let coordinator = MatchCoordinator::new();
        let (a, _ra) = ConnectionHandle::channel(16);
        let (b, _rb) = ConnectionHandle::channel(16);

        let seat_a = coordinator.join(&a, JoinRequest::default()).await;
        let seat_b = coordinator.join(&b, JoinRequest::default()).await;

        assert_ne!(seat_a.match_id, seat_b.match_id);
        assert_eq!((seat_a.slot, seat_b.slot), (1, 1));
        assert_eq!(coordinator.match_count().await, 2);
    }

    #[tokio::test]
    async fn empty_id_is_treated_as_absent() {
        let coordinator = MatchCoordinator::new();
        let (a, _ra) = ConnectionHandle::channel(16);
        let seat = coordinator
            .join(&a, JoinRequest::default().with_match_id(""))
            .await;
        assert!(!seat.match_id.is_empty());
    }

    #[tokio::test]
    async fn existing_match_keeps_its_mode() {
        let coordinator = MatchCoordinator::new();
        let (a, _ra) = ConnectionHandle::channel(16);
        let (b, _rb) = ConnectionHandle::channel(16);

        coordinator
            .join(
                &a,
                JoinRequest::new(MatchMode::ProgressionVersus).with_match_id("rv"),
            )
            .await;
        coordinator
            .join(&b, JoinRequest::default().with_match_id("rv"))
            .await;

        let snapshot = coordinator.snapshot("rv").await.unwrap();
        assert_eq!(snapshot.mode, MatchMode::ProgressionVersus);
        assert_eq!(snapshot.phase, MatchPhase::Active);
    }

    #[tokio::test]
    async fn last_leave_deletes_and_id_can_be_reused() {
        let coordinator = MatchCoordinator::new();
        let (a, _ra) = ConnectionHandle::channel(16);
        let (b, _rb) = ConnectionHandle::channel(16);

        coordinator
            .join(&a, JoinRequest::default().with_match_id("room"))
            .await;
        coordinator
            .join(&b, JoinRequest::default().with_match_id("room"))
            .await;
        coordinator.leave("room", a.id()).await;
        assert_eq!(coordinator.match_count().await, 1);
        coordinator.leave("room", b.id()).await;
        assert_eq!(coordinator.match_count().await, 0);

        let (c, _rc) = ConnectionHandle::channel(16);
        let seat = coordinator
            .join(&c, JoinRequest::default().with_match_id("room"))
            .await;
        assert_eq!(seat.slot, 1);
        let snapshot = coordinator.snapshot("room").await.unwrap();
        assert_eq!(snapshot.phase, MatchPhase::Waiting);
    }

    #[tokio::test]
    async fn non_participants_cannot_drive_a_match() {
        let coordinator = MatchCoordinator::new();
        let (a, mut ra) = ConnectionHandle::channel(16);
        let (b, _rb) = ConnectionHandle::channel(16);
        let (outsider, _ro) = ConnectionHandle::channel(16);

        coordinator
            .join(&a, JoinRequest::default().with_match_id("m"))
            .await;
        coordinator
            .join(&b, JoinRequest::default().with_match_id("m"))
            .await;
        while ra.try_recv().is_ok() {}

        coordinator.lines_cleared("m", outsider.id(), 4).await;
        assert!(ra.try_recv().is_err());
    }
}
