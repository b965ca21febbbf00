//! State of a single match.
//!
//! A [`Match`] owns the connection handles of its participants; connections
//! only ever hold the match id. All operations are synchronous and push
//! their outbound events straight into the participants' queues, so callers
//! serialize them by holding the match's lock.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::bag;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::garbage::garbage_for;
use crate::protocol::{MatchId, MatchMode, PlayerSummary, ServerMessage, Slot, SlotResult, UserId};

/// Lifecycle of a match, derived from its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Fewer than two participants have ever been present; no bag issued.
    Waiting,
    /// The opening sequence has been issued and nobody has finished yet.
    Active,
    /// At least one participant reported game over.
    Closing,
    /// `match_over` has been broadcast.
    Concluded,
}

/// A seat in the match.
#[derive(Debug, Clone)]
struct Participant {
    handle: ConnectionHandle,
    slot: Slot,
    user_id: Option<UserId>,
    pseudo: Option<String>,
}

impl Participant {
    fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            slot: self.slot,
            user_id: self.user_id,
            pseudo: self.pseudo.clone(),
        }
    }
}

/// Read-only view of a match, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSnapshot {
    pub id: MatchId,
    pub mode: MatchMode,
    pub phase: MatchPhase,
    pub players: Vec<PlayerSummary>,
    pub finished: Vec<SlotResult>,
}

/// In-memory state of one match.
#[derive(Debug)]
pub struct Match {
    id: MatchId,
    mode: MatchMode,
    /// Join order.
    participants: Vec<Participant>,
    /// Only slots of current participants; cleared on leave.
    finished: BTreeMap<Slot, SlotResult>,
    started: bool,
    concluded: bool,
}

impl Match {
    /// Create an empty match.
    pub fn new(id: MatchId, mode: MatchMode) -> Self {
        Self {
            id,
            mode,
            participants: Vec::new(),
            finished: BTreeMap::new(),
            started: false,
            concluded: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Whether `connection` currently sits in this match.
    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.participant(connection).is_some()
    }

    pub fn phase(&self) -> MatchPhase {
        if self.concluded {
            MatchPhase::Concluded
        } else if !self.started {
            MatchPhase::Waiting
        } else if self.finished.is_empty() {
            MatchPhase::Active
        } else {
            MatchPhase::Closing
        }
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        MatchSnapshot {
            id: self.id.clone(),
            mode: self.mode,
            phase: self.phase(),
            players: self.roster(),
            finished: self.finished.values().copied().collect(),
        }
    }

    /// Seat a new participant and announce it.
    ///
    /// The joiner gets `match_joined` with `self: true`, everyone else gets
    /// it without the flag, then all get the roster. The first time the
    /// match holds two participants, every participant receives `start`
    /// with the same opening sequence and its own slot.
    ///
    /// There is no seat cap. A connection joining an id that already started
    /// is seated without a bag, and `match_over` waits for its `game_over`
    /// like any other seat until it reports or disconnects.
    pub fn join(
        &mut self,
        handle: ConnectionHandle,
        user_id: Option<UserId>,
        pseudo: Option<String>,
    ) -> Slot {
        let slot = self.next_free_slot();
        let joiner = handle.id();
        self.participants.push(Participant {
            handle,
            slot,
            user_id,
            pseudo,
        });
        let players = self.participants.len();
        debug!(match_id = %self.id, %joiner, slot, players, "participant joined");

        for participant in &self.participants {
            let is_self = participant.handle.id() == joiner;
            participant.handle.deliver(ServerMessage::MatchJoined {
                match_id: self.id.clone(),
                players,
                slot,
                is_self: is_self.then_some(true),
            });
        }
        self.broadcast_roster();

        if !self.started && players == 2 {
            self.start();
        }
        slot
    }

    /// Remove a participant. Returns `false` if it was not seated here.
    ///
    /// Remaining participants get `opponent_left` and a fresh roster. If
    /// everyone still seated had already finished, the match concludes.
    pub fn leave(&mut self, connection: ConnectionId) -> bool {
        let Some(index) = self
            .participants
            .iter()
            .position(|p| p.handle.id() == connection)
        else {
            return false;
        };
        let departed = self.participants.remove(index);
        self.finished.remove(&departed.slot);
        debug!(match_id = %self.id, %connection, slot = departed.slot, "participant left");

        self.broadcast_all(&ServerMessage::OpponentLeft {});
        self.broadcast_roster();
        if self.started {
            self.try_conclude();
        }
        true
    }

    /// Apply a line clear: garbage to everyone but the sender, then one
    /// refill bag to everyone. Ignored before the match starts.
    pub fn lines_cleared(&mut self, from: ConnectionId, lines: i64) {
        if !self.started {
            debug!(match_id = %self.id, "lines_cleared before start, ignoring");
            return;
        }
        let count = garbage_for(self.mode, lines);
        if count > 0 {
            self.broadcast_except(from, &ServerMessage::Garbage { count });
        }
        self.broadcast_all(&ServerMessage::BagRefill {
            bag: bag::refill_sequence(),
        });
    }

    /// Relay a board snapshot to everyone but the sender.
    pub fn board_state(&self, from: ConnectionId, board: serde_json::Value) {
        self.broadcast_except(from, &ServerMessage::OpponentState { board });
    }

    /// Relay a progression-versus effect to everyone but the sender.
    pub fn effect(&self, from: ConnectionId, effect: serde_json::Value) {
        self.broadcast_except(from, &ServerMessage::RvEffect { effect });
    }

    /// Relay progression-versus status counters to everyone but the sender.
    pub fn status(&self, from: ConnectionId, status: serde_json::Value) {
        self.broadcast_except(from, &ServerMessage::RvStatus { status });
    }

    /// Record the sender's final result and conclude the match once every
    /// seated participant has one. Ignored before the match starts.
    pub fn game_over(&mut self, from: ConnectionId, score: u64, lines: u64) {
        if !self.started {
            debug!(match_id = %self.id, "game_over before start, ignoring");
            return;
        }
        let Some(slot) = self.participant(from).map(|p| p.slot) else {
            return;
        };
        self.finished.insert(slot, SlotResult { slot, score, lines });
        self.broadcast_except(from, &ServerMessage::OpponentFinished {});
        self.try_conclude();
    }

    fn start(&mut self) {
        self.started = true;
        let bag = bag::opening_sequence();
        info!(match_id = %self.id, mode = ?self.mode, "match started");
        for participant in &self.participants {
            participant.handle.deliver(ServerMessage::Start {
                match_id: self.id.clone(),
                bag: bag.clone(),
                slot: participant.slot,
            });
        }
    }

    fn try_conclude(&mut self) {
        if self.concluded
            || self.participants.is_empty()
            || self.finished.len() < self.participants.len()
        {
            return;
        }
        self.concluded = true;
        let results: Vec<SlotResult> = self.finished.values().copied().collect();
        info!(match_id = %self.id, ?results, "match over");
        self.broadcast_all(&ServerMessage::MatchOver { results });
    }

    fn next_free_slot(&self) -> Slot {
        (1..)
            .find(|slot| self.participants.iter().all(|p| p.slot != *slot))
            .unwrap_or(Slot::MAX)
    }

    fn participant(&self, connection: ConnectionId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.handle.id() == connection)
    }

    fn roster(&self) -> Vec<PlayerSummary> {
        self.participants.iter().map(Participant::summary).collect()
    }

    fn broadcast_roster(&self) {
        self.broadcast_all(&ServerMessage::PlayersSync {
            players: self.roster(),
        });
    }

    fn broadcast_all(&self, message: &ServerMessage) {
        for participant in &self.participants {
            participant.handle.deliver(message.clone());
        }
    }

    fn broadcast_except(&self, sender: ConnectionId, message: &ServerMessage) {
        for participant in self.participants.iter().filter(|p| p.handle.id() != sender) {
            participant.handle.deliver(message.clone());
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
    use tokio::sync::mpsc;

    fn seat() -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        ConnectionHandle::channel(64)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn started_pair(mode: MatchMode) -> (
        Match,
        (ConnectionHandle, mpsc::Receiver<ServerMessage>),
        (ConnectionHandle, mpsc::Receiver<ServerMessage>),
    ) {
        let mut m = Match::new("m".into(), mode);
        let (a, mut ra) = seat();
        let (b, mut rb) = seat();
        m.join(a.clone(), Some(1), Some("ann".into()));
        m.join(b.clone(), Some(2), Some("bob".into()));
        drain(&mut ra);
        drain(&mut rb);
        (m, (a, ra), (b, rb))
    }

    #[test]
    fn first_join_waits() {
        let mut m = Match::new("m".into(), MatchMode::StandardVersus);
        let (a, mut ra) = seat();
        assert_eq!(m.join(a, None, None), 1);
        assert_eq!(m.phase(), MatchPhase::Waiting);

        let msgs = drain(&mut ra);
        assert_eq!(
            msgs[0],
            ServerMessage::MatchJoined {
                match_id: "m".into(),
                players: 1,
                slot: 1,
                is_self: Some(true),
            }
        );
        assert!(matches!(msgs[1], ServerMessage::PlayersSync { .. }));
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn second_join_starts_with_shared_bag() {
        let mut m = Match::new("m".into(), MatchMode::StandardVersus);
        let (a, mut ra) = seat();
        let (b, mut rb) = seat();
        m.join(a, None, None);
        drain(&mut ra);
        assert_eq!(m.join(b, None, None), 2);
        assert_eq!(m.phase(), MatchPhase::Active);

        let to_a = drain(&mut ra);
        let to_b = drain(&mut rb);
        assert_eq!(
            to_a[0],
            ServerMessage::MatchJoined {
                match_id: "m".into(),
                players: 2,
                slot: 2,
                is_self: None,
            }
        );
        let start_a = to_a.iter().find_map(|msg| match msg {
            ServerMessage::Start { bag, slot, .. } => Some((bag.clone(), *slot)),
            _ => None,
        });
        let start_b = to_b.iter().find_map(|msg| match msg {
            ServerMessage::Start { bag, slot, .. } => Some((bag.clone(), *slot)),
            _ => None,
        });
        let (bag_a, slot_a) = start_a.unwrap();
        let (bag_b, slot_b) = start_b.unwrap();
        assert_eq!(bag_a, bag_b);
        assert_eq!(bag_a.len(), 21);
        assert_eq!((slot_a, slot_b), (1, 2));
    }

    #[test]
    fn start_is_issued_only_once() {
        let (mut m, (_a, mut ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        m.leave(b.id());
        let (c, mut rc) = seat();
        m.join(c, None, None);

        let starts = drain(&mut ra)
            .into_iter()
            .chain(drain(&mut rc))
            .filter(|msg| matches!(msg, ServerMessage::Start { .. }))
            .count();
        assert_eq!(starts, 0);
    }

    #[test]
    fn late_seat_holds_match_over_until_it_reports_or_leaves() {
        let (mut m, (a, mut ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        let (c, _rc) = seat();
        assert_eq!(m.join(c.clone(), None, None), 3);
        drain(&mut ra);

        m.game_over(a.id(), 100, 1);
        m.game_over(b.id(), 200, 2);
        assert_eq!(m.phase(), MatchPhase::Closing);
        assert!(!drain(&mut ra)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::MatchOver { .. })));

        m.leave(c.id());
        assert_eq!(m.phase(), MatchPhase::Concluded);
        let over = drain(&mut ra)
            .into_iter()
            .find_map(|msg| match msg {
                ServerMessage::MatchOver { results } => Some(results),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            over.iter().map(|r| r.slot).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn late_seat_reporting_completes_the_match() {
        let (mut m, (a, mut ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        let (c, _rc) = seat();
        m.join(c.clone(), None, None);
        m.game_over(a.id(), 100, 1);
        m.game_over(b.id(), 200, 2);
        m.game_over(c.id(), 0, 0);
        let over = drain(&mut ra)
            .into_iter()
            .find_map(|msg| match msg {
                ServerMessage::MatchOver { results } => Some(results),
                _ => None,
            })
            .unwrap();
        assert_eq!(over.len(), 3);
    }

    #[test]
    fn freed_slot_is_reused() {
        let (mut m, (_a, _ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        let (c, _rc) = seat();
        assert_eq!(m.join(c, None, None), 3);
        m.leave(b.id());
        let (d, _rd) = seat();
        assert_eq!(m.join(d, None, None), 2);
    }

    #[test]
    fn garbage_goes_to_opponent_and_refill_to_everyone() {
        let (mut m, (a, mut ra), (_b, mut rb)) = started_pair(MatchMode::StandardVersus);
        m.lines_cleared(a.id(), 4);

        let to_a = drain(&mut ra);
        let to_b = drain(&mut rb);
        assert!(!to_a.iter().any(|msg| matches!(msg, ServerMessage::Garbage { .. })));
        assert!(to_b.contains(&ServerMessage::Garbage { count: 4 }));

        let refill_a = to_a.iter().find_map(|msg| match msg {
            ServerMessage::BagRefill { bag } => Some(bag.clone()),
            _ => None,
        });
        let refill_b = to_b.iter().find_map(|msg| match msg {
            ServerMessage::BagRefill { bag } => Some(bag.clone()),
            _ => None,
        });
        assert_eq!(refill_a.unwrap(), refill_b.unwrap());
    }

    #[test]
    fn single_clear_sends_no_garbage_but_still_refills() {
        let (mut m, (a, _ra), (_b, mut rb)) = started_pair(MatchMode::StandardVersus);
        m.lines_cleared(a.id(), 1);
        let to_b = drain(&mut rb);
        assert_eq!(to_b.len(), 1);
        assert!(matches!(to_b[0], ServerMessage::BagRefill { .. }));
    }

    #[test]
    fn progression_garbage_equals_lines() {
        let (mut m, (a, _ra), (_b, mut rb)) = started_pair(MatchMode::ProgressionVersus);
        m.lines_cleared(a.id(), 3);
        assert!(drain(&mut rb).contains(&ServerMessage::Garbage { count: 3 }));
    }

    #[test]
    fn relays_skip_the_sender() {
        let (m, (a, mut ra), (_b, mut rb)) = started_pair(MatchMode::ProgressionVersus);
        let board = serde_json::json!({ "rows": [[0, 1], [1, 1]] });
        m.board_state(a.id(), board.clone());
        m.effect(a.id(), serde_json::json!("darkness"));
        m.status(a.id(), serde_json::json!({ "level": 4 }));

        assert!(drain(&mut ra).is_empty());
        assert_eq!(
            drain(&mut rb),
            vec![
                ServerMessage::OpponentState { board },
                ServerMessage::RvEffect {
                    effect: serde_json::json!("darkness")
                },
                ServerMessage::RvStatus {
                    status: serde_json::json!({ "level": 4 })
                },
            ]
        );
    }

    #[test]
    fn match_over_once_everyone_finished() {
        let (mut m, (a, mut ra), (b, mut rb)) = started_pair(MatchMode::StandardVersus);

        m.game_over(a.id(), 1200, 14);
        assert_eq!(m.phase(), MatchPhase::Closing);
        assert_eq!(drain(&mut rb), vec![ServerMessage::OpponentFinished {}]);
        assert!(drain(&mut ra).is_empty());

        m.game_over(b.id(), 800, 9);
        assert_eq!(m.phase(), MatchPhase::Concluded);
        let expected = ServerMessage::MatchOver {
            results: vec![
                SlotResult {
                    slot: 1,
                    score: 1200,
                    lines: 14,
                },
                SlotResult {
                    slot: 2,
                    score: 800,
                    lines: 9,
                },
            ],
        };
        assert_eq!(drain(&mut ra), vec![ServerMessage::OpponentFinished {}, expected.clone()]);
        assert_eq!(drain(&mut rb), vec![expected]);

        // A late duplicate never re-broadcasts match_over.
        m.game_over(b.id(), 900, 10);
        assert!(!drain(&mut ra)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::MatchOver { .. })));
    }

    #[test]
    fn leaving_unfinished_opponent_concludes_for_the_finished() {
        let (mut m, (a, mut ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        m.game_over(a.id(), 500, 5);
        m.leave(b.id());

        let msgs = drain(&mut ra);
        assert!(msgs.contains(&ServerMessage::OpponentLeft {}));
        assert!(msgs.contains(&ServerMessage::MatchOver {
            results: vec![SlotResult {
                slot: 1,
                score: 500,
                lines: 5,
            }],
        }));
    }

    #[test]
    fn departed_results_are_dropped() {
        let (mut m, (a, _ra), (b, _rb)) = started_pair(MatchMode::StandardVersus);
        m.game_over(a.id(), 500, 5);
        m.leave(a.id());
        let snapshot = m.snapshot();
        assert!(snapshot.finished.is_empty());
        assert_eq!(snapshot.players.len(), 1);
        assert!(m.contains(b.id()));
    }

    #[test]
    fn game_over_before_start_is_ignored() {
        let mut m = Match::new("m".into(), MatchMode::StandardVersus);
        let (a, mut ra) = seat();
        m.join(a.clone(), None, None);
        drain(&mut ra);
        m.game_over(a.id(), 10, 1);
        assert!(drain(&mut ra).is_empty());
        assert_eq!(m.phase(), MatchPhase::Waiting);
    }

    #[test]
    fn leave_of_unknown_connection_is_a_no_op() {
        let (mut m, _a, _b) = started_pair(MatchMode::StandardVersus);
        assert!(!m.leave(ConnectionId::new()));
        assert_eq!(m.len(), 2);
    }
}
