//! Shared data model for the relay server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public-facing server status, broadcast to every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

/// How a turn entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Voice,
    Text,
}

/// What the originating client wants back once the agent finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Disabled,
    Text,
    Audio,
}

impl ResponseMode {
    /// Parse the `X-Response-Mode` header value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Some(ResponseMode::Disabled),
            "text" => Some(ResponseMode::Text),
            "audio" => Some(ResponseMode::Audio),
            _ => None,
        }
    }
}

/// Lifecycle of a single operator exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Speaking,
    Completed,
    Aborted,
    Failed,
}

/// A single operator → agent → operator exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub origin: Origin,
    pub transcript: String,
    pub response_mode: ResponseMode,
    pub created_at: DateTime<Utc>,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_artifact_id: Option<String>,
    pub acknowledged: bool,
}

impl Turn {
    /// Create a fresh pending turn with a generated id.
    pub fn new(origin: Origin, response_mode: ResponseMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            transcript: String::new(),
            response_mode,
            created_at: Utc::now(),
            status: TurnStatus::Pending,
            response_text: None,
            audio_artifact_id: None,
            acknowledged: false,
        }
    }
}

/// Chat roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry in the bounded chat ring.
///
/// Ids are a monotonically increasing sequence so a reader can resume with
/// `id > last_seen_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Who raised the pending prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    AgentPrompt,
    Permission,
}

/// A selectable option within a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOption {
    pub num: u32,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
}

/// An interactive question awaiting an operator choice.
///
/// At most one prompt is active at any time; permission prompts reuse the
/// permission request id as their own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub kind: PromptKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub question: String,
    pub options: Vec<PromptOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<String>,
}

/// Operator decision on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Pending,
    Allow,
    Deny,
}

/// An out-of-band tool authorisation query raised by the agent's hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool_name: String,
    pub tool_input_summary: String,
    pub created_at: DateTime<Utc>,
    pub decision: PermissionDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionRequest {
    pub fn new(tool_name: &str, tool_input_summary: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            tool_input_summary: tool_input_summary.to_string(),
            created_at: Utc::now(),
            decision: PermissionDecision::Pending,
            reason: None,
        }
    }
}

/// Session usage and cost snapshot reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub total_in: u64,
    pub total_out: u64,
    pub total_context: u64,
    pub context_window: u64,
    pub cost: f64,
}

/// Client device categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Watch,
    Phone,
    Dashboard,
    Viewer,
}

impl ClientKind {
    /// Parse the `device` query parameter, defaulting to viewer.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "watch" => ClientKind::Watch,
            "phone" => ClientKind::Phone,
            "dashboard" => ClientKind::Dashboard,
            _ => ClientKind::Viewer,
        }
    }
}

/// Summary of one connected WebSocket session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    pub id: String,
    pub kind: ClientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_identity: Option<String>,
    pub subscribed_at: DateTime<Utc>,
}
