//! HTTP endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::config::ConfigPatch;
use crate::error::ApiError;
use crate::server::ServerState;
use crate::types::{PermissionDecision, ResponseMode, TurnStatus};

/// `GET /health`: bypasses peer auth.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `POST /transcribe`: raw audio body in, `202` with the transcript out.
/// The agent keeps working after the reply.
pub async fn transcribe_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !mime.starts_with("audio/") {
        return Err(ApiError::BadRequest(format!(
            "expected an audio/* content type, got '{}'",
            mime
        )));
    }
    let mode = parse_response_mode(&headers)?;

    let intake = state.relay.submit_audio(&body, &mime, mode).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "request_id": intake.request_id,
            "transcript": intake.transcript,
            "response_mode": intake.response_mode,
        })),
    ))
}

fn parse_response_mode(headers: &HeaderMap) -> Result<Option<ResponseMode>, ApiError> {
    match headers.get("x-response-mode").and_then(|v| v.to_str().ok()) {
        None => Ok(None),
        Some(raw) => ResponseMode::parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid response mode '{}'", raw))),
    }
}

/// `POST /api/message`: text-submission equivalent of `/transcribe`.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub text: String,
    #[serde(default)]
    pub response_mode: Option<ResponseMode>,
}

pub async fn message_handler(
    State(state): State<ServerState>,
    Json(req): Json<MessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let intake = state.relay.submit_text(&req.text, req.response_mode).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "request_id": intake.request_id,
            "transcript": intake.transcript,
            "response_mode": intake.response_mode,
        })),
    ))
}

/// `GET /api/config`
pub async fn get_config_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.relay.config().get().await)
}

/// `POST /api/config`: atomic partial update, applies to future turns.
pub async fn patch_config_handler(
    State(state): State<ServerState>,
    Json(patch): Json<ConfigPatch>,
) -> impl IntoResponse {
    Json(state.relay.config().patch(patch).await)
}

/// `GET /api/chat`: status plus the recent window used by client UIs.
pub async fn chat_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.relay.state().snapshot().await;
    Json(json!({
        "status": snapshot.status,
        "messages": snapshot.recent_chat,
        "prompt": snapshot.prompt,
        "usage": snapshot.usage,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub since: Option<u64>,
}

/// `GET /api/history`: the chat ring, optionally resumed by id.
pub async fn history_handler(
    State(state): State<ServerState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let messages = state.relay.state().history(params.since).await;
    Json(json!({ "messages": messages }))
}

/// `GET /api/response/{id}`: polling view of one turn.
pub async fn response_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let turn = match state.relay.turns().get(&id).await {
        Some(turn) => turn,
        None => return Json(json!({ "status": "not_found" })),
    };

    match turn.status {
        TurnStatus::Pending => Json(json!({ "status": "pending" })),
        TurnStatus::Aborted | TurnStatus::Failed => Json(json!({ "status": "failed" })),
        TurnStatus::Speaking => Json(json!({
            "status": "completed",
            "type": "audio",
            "response": turn.response_text,
            "audio_url": format!("/api/audio/{}", turn.id),
        })),
        TurnStatus::Completed => {
            if turn.response_mode == ResponseMode::Disabled {
                Json(json!({ "status": "disabled" }))
            } else {
                Json(json!({
                    "status": "completed",
                    "type": "text",
                    "response": turn.response_text,
                }))
            }
        }
    }
}

/// `POST /api/response/{id}/ack`: evicts the audio artifact.
pub async fn ack_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.relay.acknowledge(&id).await?;
    Ok(Json(json!({})))
}

/// `GET /api/audio/{id}`: raw synthesized bytes.
pub async fn audio_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (bytes, mime) = state
        .relay
        .audio()
        .get(&id)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

/// `POST /api/claude/restart`: restart the agent child.
pub async fn restart_handler(
    State(state): State<ServerState>,
) -> Result<impl IntoResponse, ApiError> {
    state.relay.restart_agent().await?;
    Ok(Json(json!({})))
}

/// `POST /api/abort`: cancel the current turn.
pub async fn abort_handler(State(state): State<ServerState>) -> Result<impl IntoResponse, ApiError> {
    let aborted = state.relay.abort().await?;
    Ok(Json(json!({ "aborted": aborted })))
}

#[derive(Debug, Deserialize)]
pub struct PromptRespondRequest {
    pub option: u32,
}

/// `POST /api/prompt/respond`: answer the active agent prompt.
pub async fn prompt_respond_handler(
    State(state): State<ServerState>,
    Json(req): Json<PromptRespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.relay.respond_prompt(req.option).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct PermissionRequestBody {
    pub tool_name: String,
    #[serde(default)]
    pub input_summary: String,
}

/// `POST /api/permission/request`: called out-of-band by the agent's hook.
pub async fn permission_request_handler(
    State(state): State<ServerState>,
    Json(req): Json<PermissionRequestBody>,
) -> impl IntoResponse {
    let request = state
        .relay
        .broker()
        .request(&req.tool_name, &req.input_summary)
        .await;
    Json(json!({ "request_id": request.id }))
}

/// `GET /api/permission/status/{id}`: long-poll for the decision.
pub async fn permission_status_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (decision, reason) = state
        .relay
        .broker()
        .await_decision(&id)
        .await
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "decision": decision, "reason": reason })))
}

#[derive(Debug, Deserialize)]
pub struct PermissionRespondRequest {
    pub request_id: String,
    pub decision: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /api/permission/respond`: operator decision; idempotent within
/// the retain window.
pub async fn permission_respond_handler(
    State(state): State<ServerState>,
    Json(req): Json<PermissionRespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = match req.decision.to_ascii_lowercase().as_str() {
        "allow" => PermissionDecision::Allow,
        "deny" => PermissionDecision::Deny,
        other => {
            return Err(ApiError::BadRequest(format!(
                "decision must be 'allow' or 'deny', got '{}'",
                other
            )))
        }
    };
    state
        .relay
        .broker()
        .respond(&req.request_id, decision, req.reason)
        .await
        .map_err(|err| match err {
            crate::broker::RespondError::NotFound => ApiError::NotFound,
            crate::broker::RespondError::Conflict => {
                ApiError::Conflict("request already resolved with a different decision".to_string())
            }
        })?;
    Ok(Json(json!({})))
}

/// `GET /api/clients`: currently subscribed sessions.
pub async fn clients_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.relay.state().snapshot().await;
    Json(json!({ "clients": snapshot.clients }))
}

/// `GET /api/agent/stderr`: the child's rolling stderr tail.
pub async fn agent_stderr_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({ "lines": state.relay.agent().stderr_tail() }))
}
