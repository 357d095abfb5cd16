//! Web server: component wiring, routers, listeners, and shutdown.

pub mod auth;
pub mod http;
pub mod ws;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::{AgentConfig, AgentProcess};
use crate::audio_store::AudioStore;
use crate::broker::{BrokerConfig, PermissionBroker};
use crate::config::{ConfigStore, ServerConfig};
use crate::coordinator::Relay;
use crate::dedup::DedupGuard;
use crate::events::EventBus;
use crate::server::auth::PeerAuth;
use crate::speech::{SpeechApi, SpeechClient};
use crate::turns::TurnStore;

/// Shared server state threaded into every handler.
#[derive(Clone)]
pub struct ServerState {
    pub relay: Relay,
    pub bus: EventBus,
    pub auth: PeerAuth,
    pub settings: Arc<ServerConfig>,
}

/// Wire the components together and run both listeners until a shutdown
/// signal arrives.
pub async fn run(settings: ServerConfig) -> Result<()> {
    let settings = Arc::new(settings);

    let bus = EventBus::new(settings.limits.event_buffer);
    let state_handle = crate::state::spawn(bus.clone(), settings.limits.chat_ring);
    let audio = AudioStore::new(Duration::from_secs(settings.limits.artifact_ttl_secs));
    let turns = TurnStore::new();
    let config_store = Arc::new(ConfigStore::default());
    let broker = PermissionBroker::new(
        BrokerConfig::from_settings(
            &settings.permissions,
            Duration::from_secs(settings.limits.permission_timeout_secs),
            Duration::from_secs(settings.limits.permission_retain_secs),
            Duration::from_secs(settings.limits.permission_poll_secs),
        ),
        bus.clone(),
        state_handle.clone(),
    );
    let speech: Arc<dyn SpeechApi> = Arc::new(SpeechClient::new(
        &settings.speech,
        settings.stt_api_key.clone(),
        settings.limits.body_cap_bytes,
    ));
    let (agent, exit_rx) = AgentProcess::new(
        AgentConfig::from_settings(&settings.agent, &settings.work_dir),
        state_handle.clone(),
    );
    let guard = DedupGuard::new(Duration::from_millis(settings.limits.cooldown_ms));

    let relay = Relay::new(
        agent.clone(),
        broker,
        speech,
        audio.clone(),
        turns,
        state_handle,
        config_store,
        guard,
    );

    agent.start().await.context("Failed to start agent child")?;

    let (shutdown_tx, _) = broadcast::channel(4);
    tokio::spawn(audio.run_reaper(shutdown_tx.subscribe()));
    tokio::spawn(relay.clone().supervise(exit_rx, shutdown_tx.subscribe()));

    let state = ServerState {
        relay: relay.clone(),
        bus,
        auth: PeerAuth::new(&settings.allowed_nodes, settings.node_socket.clone()),
        settings: settings.clone(),
    };

    let api = api_router(state.clone());
    let ws = ws_router(state);

    let http_addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], settings.ws_port));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", http_addr))?;
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind {}", ws_addr))?;

    info!("HTTP API listening on {}", http_addr);
    info!("WebSocket listening on {}", ws_addr);
    if settings.allowed_nodes.is_empty() {
        warn!("ALLOWED_NODES is empty, peer gate disabled");
    }

    tokio::select! {
        result = axum::serve(
            http_listener,
            api.into_make_service_with_connect_info::<SocketAddr>(),
        ) => result.context("HTTP server failed")?,
        result = axum::serve(
            ws_listener,
            ws.into_make_service_with_connect_info::<SocketAddr>(),
        ) => result.context("WebSocket server failed")?,
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    // Ordered teardown: stop background tasks, then the child.
    let _ = shutdown_tx.send(());
    relay.agent().terminate().await?;
    info!("shutdown complete");
    Ok(())
}

/// The HTTP API router. `/health` bypasses peer auth; the permission
/// status long-poll is exempt from the general request timeout.
pub fn api_router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let timed = Router::new()
        .route(
            "/transcribe",
            post(http::transcribe_handler)
                .layer(DefaultBodyLimit::max(state.settings.limits.body_cap_bytes)),
        )
        .route("/api/config", get(http::get_config_handler).post(http::patch_config_handler))
        .route("/api/chat", get(http::chat_handler))
        .route("/api/history", get(http::history_handler))
        .route("/api/response/{id}", get(http::response_handler))
        .route("/api/response/{id}/ack", post(http::ack_handler))
        .route("/api/audio/{id}", get(http::audio_handler))
        .route("/api/message", post(http::message_handler))
        .route("/api/claude/restart", post(http::restart_handler))
        .route("/api/abort", post(http::abort_handler))
        .route("/api/prompt/respond", post(http::prompt_respond_handler))
        .route("/api/permission/request", post(http::permission_request_handler))
        .route("/api/permission/respond", post(http::permission_respond_handler))
        .route("/api/clients", get(http::clients_handler))
        .route("/api/agent/stderr", get(http::agent_stderr_handler))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.settings.limits.http_timeout_secs,
        )));

    let long_poll =
        Router::new().route("/api/permission/status/{id}", get(http::permission_status_handler));

    let protected = timed.merge(long_poll).layer(middleware::from_fn_with_state(
        state.auth.clone(),
        auth::peer_auth_middleware,
    ));

    Router::new()
        .route("/health", get(http::health_handler))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The WebSocket router, served on its own port.
pub fn ws_router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth::peer_auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
