//! Configuration management.
//!
//! Two layers: the static [`ServerConfig`] loaded once at startup from an
//! optional TOML file plus environment/CLI overrides, and the runtime
//! [`ConfigStore`] (STT options, response mode) that clients patch through
//! the API.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::types::ResponseMode;

/// Main static configuration, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// WebSocket port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Working directory handed to the agent child.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Speech API credential. Environment only, never written to the file.
    #[serde(skip)]
    pub stt_api_key: String,
    /// Node identities allowed to connect. Empty disables the gate.
    #[serde(default)]
    pub allowed_nodes: Vec<String>,
    /// Path of the local node-identity daemon socket.
    #[serde(default = "default_node_socket")]
    pub node_socket: PathBuf,
    #[serde(default)]
    pub speech: SpeechSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub permissions: PermissionSettings,
}

fn default_http_port() -> u16 {
    5566
}

fn default_ws_port() -> u16 {
    5567
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_node_socket() -> PathBuf {
    PathBuf::from("/var/run/tailscale/tailscaled.sock")
}

/// External speech service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSettings {
    /// Base URL of the speech API.
    #[serde(default = "default_speech_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_speech_timeout")]
    pub request_timeout_secs: u64,
}

fn default_speech_base_url() -> String {
    "https://api.deepgram.com".to_string()
}

fn default_speech_timeout() -> u64 {
    30
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            base_url: default_speech_base_url(),
            request_timeout_secs: default_speech_timeout(),
        }
    }
}

/// How the agent child is launched and torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Child command.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments selecting the structured streaming mode.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// How long an abort waits for the child to finish draining (ms).
    #[serde(default = "default_abort_window_ms")]
    pub abort_window_ms: u64,
    /// SIGTERM grace before SIGKILL on restart/shutdown (secs).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Number of stderr lines kept for diagnostics.
    #[serde(default = "default_stderr_tail")]
    pub stderr_tail_lines: usize,
}

fn default_agent_command() -> String {
    "agent".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--stream-json".to_string()]
}

fn default_abort_window_ms() -> u64 {
    2000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_stderr_tail() -> usize {
    50
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            abort_window_ms: default_abort_window_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            stderr_tail_lines: default_stderr_tail(),
        }
    }
}

/// Bounds and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Cap on uploaded audio bodies in bytes.
    #[serde(default = "default_body_cap")]
    pub body_cap_bytes: usize,
    /// Chat ring capacity.
    #[serde(default = "default_chat_ring")]
    pub chat_ring: usize,
    /// Duplicate-submission cooldown in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// TTS artifact time-to-live in seconds.
    #[serde(default = "default_artifact_ttl")]
    pub artifact_ttl_secs: u64,
    /// Deadline for an unanswered permission request in seconds.
    #[serde(default = "default_permission_timeout")]
    pub permission_timeout_secs: u64,
    /// How long a resolved permission request stays pollable in seconds.
    #[serde(default = "default_permission_retain")]
    pub permission_retain_secs: u64,
    /// Upper bound of a single permission status long-poll in seconds.
    #[serde(default = "default_permission_poll")]
    pub permission_poll_secs: u64,
    /// Per-subscriber event buffer capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// General HTTP request timeout in seconds (long-poll endpoints exempt).
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_body_cap() -> usize {
    25 * 1024 * 1024
}

fn default_chat_ring() -> usize {
    200
}

fn default_cooldown_ms() -> u64 {
    5000
}

fn default_artifact_ttl() -> u64 {
    600
}

fn default_permission_timeout() -> u64 {
    300
}

fn default_permission_retain() -> u64 {
    60
}

fn default_permission_poll() -> u64 {
    30
}

fn default_event_buffer() -> usize {
    256
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            body_cap_bytes: default_body_cap(),
            chat_ring: default_chat_ring(),
            cooldown_ms: default_cooldown_ms(),
            artifact_ttl_secs: default_artifact_ttl(),
            permission_timeout_secs: default_permission_timeout(),
            permission_retain_secs: default_permission_retain(),
            permission_poll_secs: default_permission_poll(),
            event_buffer: default_event_buffer(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

/// Tools the permission broker may allow without asking the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// Tool names allowed outright.
    #[serde(default = "default_auto_allow_tools")]
    pub auto_allow_tools: Vec<String>,
    /// Tools whose input is a shell command line.
    #[serde(default = "default_command_tools")]
    pub command_tools: Vec<String>,
    /// Read-only commands allowed without asking when invoked by a command tool.
    #[serde(default = "default_read_only_commands")]
    pub read_only_commands: Vec<String>,
}

fn default_auto_allow_tools() -> Vec<String> {
    vec!["Read".to_string(), "Glob".to_string(), "Grep".to_string()]
}

fn default_command_tools() -> Vec<String> {
    vec!["Bash".to_string()]
}

fn default_read_only_commands() -> Vec<String> {
    ["ls", "cat", "head", "tail", "wc", "pwd", "echo", "git status", "git log", "git diff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            auto_allow_tools: default_auto_allow_tools(),
            command_tools: default_command_tools(),
            read_only_commands: default_read_only_commands(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            ws_port: default_ws_port(),
            work_dir: default_work_dir(),
            stt_api_key: String::new(),
            allowed_nodes: Vec::new(),
            node_socket: default_node_socket(),
            speech: SpeechSettings::default(),
            agent: AgentSettings::default(),
            limits: LimitSettings::default(),
            permissions: PermissionSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load from the given file (or the platform default location) and
    /// fall back to defaults when the file does not exist.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p.clone(),
            None => config_path()?,
        };

        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: ServerConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(ServerConfig::default())
        }
    }
}

/// Default configuration file path.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voice-relay", "voice-relay")
        .context("Failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Runtime configuration mutated through `/api/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// STT model name.
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    /// STT language hint.
    #[serde(default = "default_stt_language")]
    pub stt_language: String,
    /// Free-form STT flags, passed through as query parameters.
    #[serde(default)]
    pub stt_options: BTreeMap<String, String>,
    /// Default response mode for new turns.
    #[serde(default = "default_response_mode")]
    pub response_mode: ResponseMode,
    /// TTS voice/model name.
    #[serde(default = "default_tts_voice")]
    pub tts_voice: String,
    /// Maximum codepoints sent to TTS.
    #[serde(default = "default_tts_max_chars")]
    pub tts_max_chars: usize,
}

fn default_stt_model() -> String {
    "nova-2".to_string()
}

fn default_stt_language() -> String {
    "en".to_string()
}

fn default_response_mode() -> ResponseMode {
    ResponseMode::Text
}

fn default_tts_voice() -> String {
    "aura-asteria-en".to_string()
}

fn default_tts_max_chars() -> usize {
    1500
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stt_model: default_stt_model(),
            stt_language: default_stt_language(),
            stt_options: BTreeMap::new(),
            response_mode: default_response_mode(),
            tts_voice: default_tts_voice(),
            tts_max_chars: default_tts_max_chars(),
        }
    }
}

/// Partial update for [`RuntimeConfig`]. Unknown fields are ignored at
/// decode time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub stt_model: Option<String>,
    pub stt_language: Option<String>,
    pub stt_options: Option<BTreeMap<String, String>>,
    pub response_mode: Option<ResponseMode>,
    pub tts_voice: Option<String>,
    pub tts_max_chars: Option<usize>,
}

/// Guarded holder of the runtime configuration. Patches apply atomically;
/// readers see one version or the next, never a mix.
pub struct ConfigStore {
    inner: RwLock<RuntimeConfig>,
}

impl ConfigStore {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }

    pub async fn get(&self) -> RuntimeConfig {
        self.inner.read().await.clone()
    }

    pub async fn patch(&self, patch: ConfigPatch) -> RuntimeConfig {
        let mut config = self.inner.write().await;
        if let Some(v) = patch.stt_model {
            config.stt_model = v;
        }
        if let Some(v) = patch.stt_language {
            config.stt_language = v;
        }
        if let Some(v) = patch.stt_options {
            config.stt_options = v;
        }
        if let Some(v) = patch.response_mode {
            config.response_mode = v;
        }
        if let Some(v) = patch.tts_voice {
            config.tts_voice = v;
        }
        if let Some(v) = patch.tts_max_chars {
            config.tts_max_chars = v;
        }
        config.clone()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.http_port, 5566);
        assert_eq!(config.ws_port, 5567);
        assert_eq!(config.limits.body_cap_bytes, 25 * 1024 * 1024);
        assert_eq!(config.limits.chat_ring, 200);
        assert!(config.allowed_nodes.is_empty());
    }

    #[test]
    fn test_server_config_parses_partial_file() {
        let config: ServerConfig = toml::from_str(
            r#"
            http_port = 8080
            allowed_nodes = ["laptop", "phone"]

            [agent]
            command = "/usr/local/bin/agent"
            "#,
        )
        .unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ws_port, 5567);
        assert_eq!(config.allowed_nodes, vec!["laptop", "phone"]);
        assert_eq!(config.agent.command, "/usr/local/bin/agent");
        assert_eq!(config.agent.args, vec!["--stream-json"]);
    }

    #[tokio::test]
    async fn test_patch_is_partial_and_atomic() {
        let store = ConfigStore::default();
        let before = store.get().await;

        let updated = store
            .patch(ConfigPatch {
                tts_voice: Some("aura-orion-en".to_string()),
                ..Default::default()
            })
            .await;

        assert_eq!(updated.tts_voice, "aura-orion-en");
        assert_eq!(updated.stt_model, before.stt_model);
        assert_eq!(store.get().await, updated);
    }

    #[tokio::test]
    async fn test_full_round_trip_is_identity() {
        let store = ConfigStore::default();
        let current = store.get().await;

        // Re-posting the full config as a patch must not change anything.
        let json = serde_json::to_string(&current).unwrap();
        let patch: ConfigPatch = serde_json::from_str(&json).unwrap();
        let after = store.patch(patch).await;
        assert_eq!(after, current);
    }

    #[test]
    fn test_patch_ignores_unknown_fields() {
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"tts_max_chars": 900, "no_such_field": true}"#).unwrap();
        assert_eq!(patch.tts_max_chars, Some(900));
    }
}
