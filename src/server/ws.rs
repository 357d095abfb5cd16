//! WebSocket fan-out endpoint.
//!
//! Each connection gets a registered client session, a fresh state
//! snapshot, and then the live event stream. The server pings every 30 s
//! and drops a connection after three unanswered pings.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::events::Event;
use crate::server::ServerState;
use crate::types::{ClientKind, ClientSummary, Usage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PINGS: u32 = 3;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Commands clients may send over the socket; unknown ones are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ClientCommand {
    Ack { id: String },
    Abort,
    #[serde(other)]
    Unknown,
}

/// `GET /ws?device=<kind>&id=<opaque>`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params, peer))
}

async fn handle_socket(socket: WebSocket, state: ServerState, params: WsParams, peer: SocketAddr) {
    let client_id = params
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let kind = params
        .device
        .as_deref()
        .map(ClientKind::parse)
        .unwrap_or(ClientKind::Viewer);
    let peer_identity = state.auth.identity(peer).await;

    info!("client {} connected ({:?}, peer {})", client_id, kind, peer);
    state
        .relay
        .state()
        .client_connected(ClientSummary {
            id: client_id.clone(),
            kind,
            peer_identity,
            subscribed_at: chrono::Utc::now(),
        })
        .await;

    // Subscribe before snapshotting so nothing between the two is lost.
    let mut sub = state.bus.subscribe();
    let snapshot = state.relay.state().snapshot().await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Every (re)connect starts from a fresh snapshot.
    let mut ok = send_event(&mut ws_tx, &Event::HistorySnapshot { messages: snapshot.recent_chat })
        .await
        .is_ok();
    ok = ok
        && send_event(&mut ws_tx, &Event::StateChanged { status: snapshot.status })
            .await
            .is_ok();
    if let Some(prompt) = snapshot.prompt {
        ok = ok && send_event(&mut ws_tx, &Event::PromptPosted { prompt }).await.is_ok();
    }
    if let Some(Usage { total_in, total_out, total_context, context_window, cost }) = snapshot.usage
    {
        ok = ok
            && send_event(
                &mut ws_tx,
                &Event::UsageUpdated { total_in, total_out, total_context, context_window, cost },
            )
            .await
            .is_ok();
    }
    if !ok {
        state.relay.state().client_disconnected(client_id).await;
        return;
    }

    let missed = Arc::new(AtomicU32::new(0));

    // Writer: live events plus heartbeat pings.
    let writer_missed = missed.clone();
    let writer_id = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            tokio::select! {
                event = sub.recv() => {
                    match event {
                        Some(event) => {
                            if send_event(&mut ws_tx, &event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    if writer_missed.load(Ordering::SeqCst) >= MAX_MISSED_PINGS {
                        debug!("client {} missed {} pings, dropping", writer_id, MAX_MISSED_PINGS);
                        break;
                    }
                    writer_missed.fetch_add(1, Ordering::SeqCst);
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        if sub.dropped() > 0 {
            debug!("client {} lost {} events to backpressure", writer_id, sub.dropped());
        }
    });

    // Reader: client commands and pong bookkeeping.
    let reader_state = state.clone();
    let reader_missed = missed.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(ClientCommand::Ack { id }) => {
                        if let Err(err) = reader_state.relay.acknowledge(&id).await {
                            debug!("ws ack for {} failed: {}", id, err);
                        }
                    }
                    Ok(ClientCommand::Abort) => {
                        if let Err(err) = reader_state.relay.abort().await {
                            debug!("ws abort failed: {}", err);
                        }
                    }
                    Ok(ClientCommand::Unknown) | Err(_) => {
                        debug!("ignoring unknown ws command");
                    }
                },
                Message::Pong(_) => {
                    reader_missed.store(0, Ordering::SeqCst);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.relay.state().client_disconnected(client_id.clone()).await;
    info!("client {} disconnected", client_id);
}

async fn send_event(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}
