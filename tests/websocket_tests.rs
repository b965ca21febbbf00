#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Live matches over real WebSocket connections against a bound
//! [`MatchServer`].

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use stackfall_server::protocol::{ClientMessage, ServerMessage};
use stackfall_server::{MatchCoordinator, MatchMode, MatchServer, SessionSettings};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

async fn spawn_server(coordinator: MatchCoordinator) -> (SocketAddr, oneshot::Sender<()>) {
    let server = MatchServer::bind("127.0.0.1:0", coordinator, SessionSettings::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    (addr, stop)
}

async fn dial(addr: SocketAddr) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    client
}

async fn send(client: &mut Client, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    client.send(Message::Text(text.into())).await.unwrap();
}

async fn recv(client: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn recv_until(client: &mut Client, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    for _ in 0..32 {
        let message = recv(client).await;
        if pred(&message) {
            return message;
        }
    }
    panic!("expected message never arrived");
}

fn join(match_id: &str) -> ClientMessage {
    ClientMessage::JoinMatch {
        match_id: Some(match_id.to_string()),
        user_id: None,
        pseudo: None,
        mode: MatchMode::StandardVersus,
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn pair_start_and_garbage_over_websocket() {
    let coordinator = MatchCoordinator::new();
    let (addr, _stop) = spawn_server(coordinator).await;
    let mut alice = dial(addr).await;
    let mut bob = dial(addr).await;

    send(&mut alice, &join("ws")).await;
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::MatchJoined { slot: 1, .. }
    ));
    send(&mut bob, &join("ws")).await;

    let is_start = |m: &ServerMessage| matches!(m, ServerMessage::Start { .. });
    let ServerMessage::Start { bag: bag_a, .. } = recv_until(&mut alice, is_start).await else {
        unreachable!()
    };
    let ServerMessage::Start { bag: bag_b, slot, .. } = recv_until(&mut bob, is_start).await
    else {
        unreachable!()
    };
    assert_eq!(bag_a, bag_b);
    assert_eq!(bag_a.len(), 21);
    assert_eq!(slot, 2);

    send(&mut alice, &ClientMessage::LinesCleared { lines: 4 }).await;
    assert_eq!(recv(&mut bob).await, ServerMessage::Garbage { count: 4 });
}

#[tokio::test]
async fn closing_the_socket_notifies_the_opponent() {
    let coordinator = MatchCoordinator::new();
    let (addr, _stop) = spawn_server(coordinator.clone()).await;
    let mut alice = dial(addr).await;
    let mut bob = dial(addr).await;

    send(&mut alice, &join("drop")).await;
    recv(&mut alice).await;
    send(&mut bob, &join("drop")).await;
    recv_until(&mut bob, |m| matches!(m, ServerMessage::Start { .. })).await;

    bob.close(None).await.unwrap();
    assert_eq!(
        recv_until(&mut alice, |m| matches!(m, ServerMessage::OpponentLeft {})).await,
        ServerMessage::OpponentLeft {}
    );

    alice.close(None).await.unwrap();
    for _ in 0..100 {
        if coordinator.match_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("match was not deleted after both sockets closed");
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (addr, stop) = spawn_server(MatchCoordinator::new()).await;
    stop.send(()).unwrap();

    let mut refused = false;
    for _ in 0..50 {
        if tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .is_err()
        {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(refused, "listener still accepting after shutdown");
}
