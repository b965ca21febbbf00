#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end session tests: JSON text in through a [`MockTransport`],
//! JSON text out, with real sessions running on spawned tasks.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{connect, is_match_over, is_start, join, join_as, MockTransport};
use stackfall_server::protocol::{ClientMessage, ServerMessage};
use stackfall_server::session::run_session;
use stackfall_server::{MatchCoordinator, MatchMode};

async fn wait_for_match_count(coordinator: &MatchCoordinator, expected: usize) {
    for _ in 0..100 {
        if coordinator.match_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "match count stayed at {} instead of {expected}",
        coordinator.match_count().await
    );
}

// ════════════════════════════════════════════════════════════════════
// Pairing over the wire
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn two_clients_receive_identical_opening_bags() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    let (mut bob, _tb) = connect(&coordinator);

    alice.send(&join("wire"));
    let first = alice.recv().await;
    assert_eq!(
        first,
        ServerMessage::MatchJoined {
            match_id: "wire".into(),
            players: 1,
            slot: 1,
            is_self: Some(true),
        }
    );
    bob.send(&join("wire"));

    let ServerMessage::Start { bag: bag_a, slot: slot_a, .. } = alice.recv_until(is_start).await
    else {
        unreachable!()
    };
    let ServerMessage::Start { bag: bag_b, slot: slot_b, .. } = bob.recv_until(is_start).await
    else {
        unreachable!()
    };
    assert_eq!(bag_a, bag_b);
    assert_eq!((slot_a, slot_b), (1, 2));
}

#[tokio::test]
async fn raw_wire_format_is_accepted() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);

    alice.send_raw(
        r#"{"type":"join_match","data":{"matchId":"raw","userId":5,"pseudo":"al","mode":"progression_versus"}}"#,
    );
    alice.recv().await;
    let ServerMessage::PlayersSync { players } = alice.recv().await else {
        panic!("expected roster");
    };
    assert_eq!(players[0].user_id, Some(5));
    assert_eq!(
        coordinator.snapshot("raw").await.unwrap().mode,
        MatchMode::ProgressionVersus
    );
}

#[tokio::test]
async fn unknown_mode_defaults_to_standard() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    alice.send_raw(r#"{"type":"join_match","data":{"matchId":"m","mode":"CHAOS"}}"#);
    alice.recv().await;
    assert_eq!(
        coordinator.snapshot("m").await.unwrap().mode,
        MatchMode::StandardVersus
    );
}

// ════════════════════════════════════════════════════════════════════
// Malformed input
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn malformed_messages_are_dropped_and_session_survives() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, task) = connect(&coordinator);

    alice.send_raw("not json at all");
    alice.send_raw(r#"{"type":"lines_cleared","data":{"lines":"four"}}"#);
    alice.send_raw(r#"{"type":"warp_drive","data":{}}"#);
    alice.assert_silent().await;
    assert!(!task.is_finished());

    alice.send(&join("after-noise"));
    assert!(matches!(
        alice.recv().await,
        ServerMessage::MatchJoined { .. }
    ));
}

#[tokio::test]
async fn gameplay_before_join_gets_no_reply() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    alice.send(&ClientMessage::LinesCleared { lines: 4 });
    alice.send(&ClientMessage::GameOver { score: 1, lines: 1 });
    alice.assert_silent().await;
    assert_eq!(coordinator.match_count().await, 0);
}

// ════════════════════════════════════════════════════════════════════
// Gameplay
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn full_match_flow() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    let (mut bob, _tb) = connect(&coordinator);

    alice.send(&join_as("flow", 1, "alice", MatchMode::StandardVersus));
    alice.recv_until(|m| matches!(m, ServerMessage::PlayersSync { .. })).await;
    bob.send(&join_as("flow", 2, "bob", MatchMode::StandardVersus));
    alice.recv_until(is_start).await;
    bob.recv_until(is_start).await;

    alice.send(&ClientMessage::LinesCleared { lines: 3 });
    assert_eq!(bob.recv().await, ServerMessage::Garbage { count: 2 });
    assert!(matches!(bob.recv().await, ServerMessage::BagRefill { .. }));
    assert!(matches!(alice.recv().await, ServerMessage::BagRefill { .. }));

    let board = serde_json::json!({"rows": [0, 0, 7]});
    bob.send(&ClientMessage::State {
        board: board.clone(),
    });
    assert_eq!(alice.recv().await, ServerMessage::OpponentState { board });

    alice.send(&ClientMessage::GameOver {
        score: 400,
        lines: 3,
    });
    assert_eq!(bob.recv().await, ServerMessage::OpponentFinished {});
    bob.send(&ClientMessage::GameOver {
        score: 100,
        lines: 0,
    });

    let ServerMessage::MatchOver { results } = alice.recv_until(is_match_over).await else {
        unreachable!()
    };
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].score, 400);
    assert_eq!(results[1].score, 100);
    assert!(matches!(
        bob.recv_until(is_match_over).await,
        ServerMessage::MatchOver { .. }
    ));
}

// ════════════════════════════════════════════════════════════════════
// Leaving
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disconnect_notifies_opponent_and_closes_transport() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    let (mut bob, tb) = connect(&coordinator);

    alice.send(&join("bye"));
    alice.recv().await;
    bob.send(&join("bye"));
    alice.recv_until(is_start).await;

    let closed = bob.closed.clone();
    bob.disconnect();
    tb.await.unwrap();
    assert!(closed.load(Ordering::Relaxed));

    assert_eq!(
        alice
            .recv_until(|m| matches!(m, ServerMessage::OpponentLeft {}))
            .await,
        ServerMessage::OpponentLeft {}
    );
    let ServerMessage::PlayersSync { players } = alice.recv().await else {
        panic!("expected roster after departure");
    };
    assert_eq!(players.len(), 1);
}

#[tokio::test]
async fn last_disconnect_deletes_the_match() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, ta) = connect(&coordinator);
    alice.send(&join("gc"));
    alice.recv().await;
    assert_eq!(coordinator.match_count().await, 1);

    alice.disconnect();
    ta.await.unwrap();
    assert_eq!(coordinator.match_count().await, 0);
}

#[tokio::test]
async fn transport_error_ends_the_session() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, ta) = connect(&coordinator);
    alice.send(&join("err"));
    alice.recv().await;

    alice.fail("connection reset");
    ta.await.unwrap();
    assert!(alice.closed.load(Ordering::Relaxed));
    assert_eq!(coordinator.match_count().await, 0);
}

#[tokio::test]
async fn rejoin_moves_the_connection() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, _ta) = connect(&coordinator);
    let (mut bob, _tb) = connect(&coordinator);

    bob.send(&join("old"));
    bob.recv().await;
    alice.send(&join("old"));
    bob.recv_until(is_start).await;

    alice.send(&join("new"));
    assert_eq!(
        bob.recv_until(|m| matches!(m, ServerMessage::OpponentLeft {}))
            .await,
        ServerMessage::OpponentLeft {}
    );
    wait_for_match_count(&coordinator, 2).await;
    assert_eq!(coordinator.snapshot("new").await.unwrap().players.len(), 1);
}

#[tokio::test]
async fn leave_match_frame_does_not_leave() {
    let coordinator = MatchCoordinator::new();
    let (mut alice, ta) = connect(&coordinator);
    let (mut bob, _tb) = connect(&coordinator);

    alice.send(&join("stay"));
    alice.recv().await;
    bob.send(&join("stay"));
    bob.recv_until(is_start).await;
    bob.drain();

    alice.send_raw(r#"{"type":"leave_match","data":{}}"#);
    bob.assert_silent().await;
    assert!(!ta.is_finished());
    assert_eq!(coordinator.snapshot("stay").await.unwrap().players.len(), 2);

    // Closing the connection is what leaves.
    alice.disconnect();
    ta.await.unwrap();
    assert_eq!(
        bob.recv_until(|m| matches!(m, ServerMessage::OpponentLeft {}))
            .await,
        ServerMessage::OpponentLeft {}
    );
}

#[tokio::test]
async fn session_can_run_on_a_bare_transport() {
    let coordinator = MatchCoordinator::new();
    let (transport, mut client) = MockTransport::pair();
    let session = tokio::spawn(run_session(transport, coordinator.clone(), 1));

    client.send(&join("tiny"));
    // Capacity 1 still delivers the first message once the session drains.
    assert!(matches!(
        client.recv().await,
        ServerMessage::MatchJoined { .. }
    ));
    client.disconnect();
    session.await.unwrap();
}
