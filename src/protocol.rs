//! Wire types for the live match channel.
//!
//! Every message is a JSON text frame of the form
//! `{"type": "<snake_case name>", "data": {...}}`. Field names inside `data`
//! are `camelCase` to match the browser client.

use serde::{Deserialize, Deserializer, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque match identifier (client-supplied or server-generated).
pub type MatchId = String;

/// Seat number within a match, assigned in join order starting at 1.
pub type Slot = u32;

/// Stable numeric user id resolved by the identity provider.
pub type UserId = u64;

// ── Enums ───────────────────────────────────────────────────────────

/// Rule set a match is played under.
///
/// Deserialization is lenient: a missing, unknown or non-string value
/// falls back to [`MatchMode::StandardVersus`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchMode {
    /// Classic versus: garbage follows the fixed clear table.
    #[default]
    StandardVersus,
    /// Progression versus: garbage equals the cleared line count, and
    /// participants exchange effect/status relays.
    ProgressionVersus,
}

impl MatchMode {
    /// Parse a wire mode name, defaulting to [`MatchMode::StandardVersus`].
    pub fn from_wire(name: &str) -> Self {
        if name.eq_ignore_ascii_case("PROGRESSION_VERSUS") {
            Self::ProgressionVersus
        } else {
            Self::StandardVersus
        }
    }
}

impl<'de> Deserialize<'de> for MatchMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(value.as_str().map(Self::from_wire).unwrap_or_default())
    }
}

/// One of the seven tetromino shapes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Piece {
    I,
    O,
    T,
    S,
    Z,
    J,
    L,
}

impl Piece {
    /// The fixed piece alphabet, in canonical order.
    pub const ALL: [Piece; 7] = [
        Piece::I,
        Piece::O,
        Piece::T,
        Piece::S,
        Piece::Z,
        Piece::J,
        Piece::L,
    ];
}

// ── Structs ─────────────────────────────────────────────────────────

/// Roster entry broadcast in [`ServerMessage::PlayersSync`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub slot: Slot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pseudo: Option<String>,
}

/// Final standing of one slot, broadcast in [`ServerMessage::MatchOver`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotResult {
    pub slot: Slot,
    pub score: u64,
    pub lines: u64,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from a browser client to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join an existing match by id, or create a new one.
    JoinMatch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_id: Option<MatchId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        /// Display name shown to the opponent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pseudo: Option<String>,
        #[serde(default)]
        mode: MatchMode,
    },
    /// The sender locked a piece that cleared `lines` rows.
    LinesCleared { lines: i64 },
    /// Snapshot of the sender's board, relayed verbatim.
    State { board: serde_json::Value },
    /// The sender topped out.
    GameOver { score: u64, lines: u64 },
    /// Timed modifier sent to the opponent (progression versus).
    RvEffect { effect: serde_json::Value },
    /// Summary counters sent to the opponent (progression versus).
    RvStatus { status: serde_json::Value },
}

/// Message types pushed from the coordinator to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Someone joined the match. `self` is only set on the joiner's own copy.
    MatchJoined {
        match_id: MatchId,
        /// Participant count after the join.
        players: usize,
        /// Slot of the participant that joined.
        slot: Slot,
        #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
        is_self: Option<bool>,
    },
    /// Both seats are filled; play starts on the shared opening sequence.
    Start {
        match_id: MatchId,
        bag: Vec<Piece>,
        /// The recipient's own slot.
        slot: Slot,
    },
    /// Supplemental pieces appended to every participant's queue.
    BagRefill { bag: Vec<Piece> },
    /// Incoming garbage rows.
    Garbage { count: u32 },
    /// A participant left the match.
    OpponentLeft {},
    /// Relayed board snapshot.
    OpponentState { board: serde_json::Value },
    /// Another participant topped out.
    OpponentFinished {},
    /// Every remaining participant has finished.
    MatchOver { results: Vec<SlotResult> },
    /// Full roster, sent after every join and leave.
    PlayersSync { players: Vec<PlayerSummary> },
    /// Relayed timed modifier.
    RvEffect { effect: serde_json::Value },
    /// Relayed summary counters.
    RvStatus { status: serde_json::Value },
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
    fn unknown_mode_defaults_to_standard() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_match","data":{"mode":"battle_royale"}}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinMatch {
                mode: MatchMode::StandardVersus,
                ..
            }
        ));
    }

    #[test]
    fn non_string_mode_defaults_to_standard() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_match","data":{"mode":7}}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinMatch {
                mode: MatchMode::StandardVersus,
                ..
            }
        ));
    }

    #[test]
    fn progression_mode_is_recognized() {
        assert_eq!(
            MatchMode::from_wire("PROGRESSION_VERSUS"),
            MatchMode::ProgressionVersus
        );
        assert_eq!(
            MatchMode::from_wire("progression_versus"),
            MatchMode::ProgressionVersus
        );
    }

    #[test]
    fn self_flag_is_omitted_for_other_participants() {
        let msg = ServerMessage::MatchJoined {
            match_id: "m1".into(),
            players: 2,
            slot: 2,
            is_self: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["data"].get("self").is_none());
        assert_eq!(json["data"]["matchId"], "m1");
    }
}
