//! Live WebSocket fan-out tests against an ephemeral listener.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use voice_relay::server::{ws_router, ServerState};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_ws(state: ServerState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = ws_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws{}", addr, query)).await.unwrap();
    ws
}

/// Next JSON frame, skipping control frames.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("frame error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Collect frames until one matches, returning everything seen.
async fn collect_until(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Vec<Value> {
    let mut seen = Vec::new();
    for _ in 0..50 {
        let frame = next_json(ws).await;
        let done = pred(&frame);
        seen.push(frame);
        if done {
            return seen;
        }
    }
    panic!("expected frame never arrived; saw {:?}", seen);
}

#[tokio::test]
async fn test_connect_delivers_snapshot_then_live_turn_events() {
    let harness = common::harness("ignored").await;
    let addr = start_ws(harness.state.clone()).await;

    let mut ws = connect(addr, "?device=watch&id=c1").await;

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "history_snapshot");
    assert_eq!(first["messages"].as_array().unwrap().len(), 0);

    let second = next_json(&mut ws).await;
    assert_eq!(second["type"], "state_changed");
    assert_eq!(second["status"], "idle");

    // The session is on the roster.
    let snapshot = harness.relay.state().snapshot().await;
    assert_eq!(snapshot.clients.len(), 1);
    assert_eq!(snapshot.clients[0].id, "c1");

    // Drive a text turn and watch it stream out.
    harness.relay.submit_text("hello", None).await.unwrap();
    let frames = collect_until(&mut ws, |f| {
        f["type"] == "chat_appended" && f["message"]["role"] == "assistant"
    })
    .await;

    let index_of = |pred: &dyn Fn(&Value) -> bool| frames.iter().position(|f| pred(f));
    let user = index_of(&|f: &Value| {
        f["type"] == "chat_appended" && f["message"]["role"] == "user" && f["message"]["content"] == "hello"
    })
    .expect("no user chat_appended");
    let chunk = index_of(&|f: &Value| f["type"] == "text_chunk" && f["text"] == "hi")
        .expect("no text_chunk");
    let assistant = index_of(&|f: &Value| {
        f["type"] == "chat_appended" && f["message"]["role"] == "assistant" && f["message"]["content"] == "hi"
    })
    .expect("no assistant chat_appended");
    assert!(user < chunk && chunk < assistant);

    // The idle transition follows the assistant message.
    let frames = collect_until(&mut ws, |f| f["type"] == "state_changed" && f["status"] == "idle").await;
    assert!(!frames.is_empty());

    harness.relay.agent().terminate().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_gets_fresh_history_snapshot() {
    let harness = common::harness("ignored").await;
    let addr = start_ws(harness.state.clone()).await;

    harness.relay.submit_text("hello", None).await.unwrap();

    // Wait for the turn to finish before reconnecting.
    for _ in 0..150 {
        let snapshot = harness.relay.state().snapshot().await;
        if snapshot.recent_chat.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ws = connect(addr, "").await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "history_snapshot");
    let messages = first["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");

    harness.relay.agent().terminate().await.unwrap();
}

#[tokio::test]
async fn test_unknown_commands_ignored_and_connection_survives() {
    let harness = common::harness("ignored").await;
    let addr = start_ws(harness.state.clone()).await;

    let mut ws = connect(addr, "?id=c9").await;
    let _ = next_json(&mut ws).await; // history_snapshot
    let _ = next_json(&mut ws).await; // state_changed

    ws.send(Message::Text(json!({"cmd": "dance"}).to_string().into())).await.unwrap();
    ws.send(Message::Text(json!({"cmd": "abort"}).to_string().into())).await.unwrap();

    // The connection still streams events afterwards.
    harness.relay.submit_text("still alive", None).await.unwrap();
    let frames = collect_until(&mut ws, |f| {
        f["type"] == "chat_appended" && f["message"]["content"] == "still alive"
    })
    .await;
    assert!(!frames.is_empty());

    harness.relay.agent().terminate().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_updates_roster() {
    let harness = common::harness("ignored").await;
    let addr = start_ws(harness.state.clone()).await;

    let mut ws = connect(addr, "?id=gone-soon").await;
    let _ = next_json(&mut ws).await;
    let _ = next_json(&mut ws).await;
    assert_eq!(harness.relay.state().snapshot().await.clients.len(), 1);

    ws.close(None).await.unwrap();
    for _ in 0..150 {
        if harness.relay.state().snapshot().await.clients.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.relay.state().snapshot().await.clients.is_empty());

    harness.relay.agent().terminate().await.unwrap();
}
