//! Shared fixtures: stub agent scripts, a stub speech backend, and a
//! fully wired server state for router-level tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use voice_relay::agent::{AgentConfig, AgentProcess};
use voice_relay::audio_store::AudioStore;
use voice_relay::broker::{BrokerConfig, PermissionBroker};
use voice_relay::config::{ConfigStore, RuntimeConfig, ServerConfig};
use voice_relay::coordinator::Relay;
use voice_relay::dedup::DedupGuard;
use voice_relay::events::EventBus;
use voice_relay::server::auth::PeerAuth;
use voice_relay::server::ServerState;
use voice_relay::speech::{SpeechApi, SpeechError, SynthesizedAudio, Transcript};
use voice_relay::turns::TurnStore;

/// Speech backend with canned answers.
pub struct StubSpeech {
    pub transcript: String,
}

#[async_trait]
impl SpeechApi for StubSpeech {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _mime: &str,
        _config: &RuntimeConfig,
    ) -> Result<Transcript, SpeechError> {
        Ok(Transcript { text: self.transcript.clone(), confidence: Some(0.99) })
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: &str,
        _max_chars: usize,
    ) -> Result<SynthesizedAudio, SpeechError> {
        Ok(SynthesizedAudio { bytes: vec![7u8; 32], mime: "audio/mpeg".to_string() })
    }
}

/// Stub agent: answers every prompt line with one "hi" chunk and an end.
pub fn write_echo_agent(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "echo-agent.sh",
        concat!(
            "#!/bin/sh\n",
            "while IFS= read -r line; do\n",
            "  id=$(printf '%s' \"$line\" | sed -n 's/.*\"turn_id\":\"\\([^\"]*\\)\".*/\\1/p')\n",
            "  printf '{\"kind\":\"text_chunk\",\"turn_id\":\"%s\",\"delta\":\"hi\"}\\n' \"$id\"\n",
            "  printf '{\"kind\":\"message_end\",\"turn_id\":\"%s\"}\\n' \"$id\"\n",
            "done\n",
        ),
    )
}

/// Stub agent that accepts prompts but never answers them.
pub fn write_silent_agent(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "silent-agent.sh",
        concat!(
            "#!/bin/sh\n",
            "trap '' INT\n",
            "while IFS= read -r line; do :; done\n",
        ),
    )
}

fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Settings tightened for tests: short permission windows.
pub fn test_settings(agent_command: &Path, work_dir: &Path) -> ServerConfig {
    let mut settings = ServerConfig::default();
    settings.work_dir = work_dir.to_path_buf();
    settings.agent.command = agent_command.to_string_lossy().to_string();
    settings.agent.args = Vec::new();
    settings.agent.abort_window_ms = 200;
    settings.limits.permission_timeout_secs = 3;
    settings.limits.permission_poll_secs = 1;
    settings
}

/// Everything a router test needs, with the temp dir kept alive.
pub struct TestHarness {
    pub state: ServerState,
    pub relay: Relay,
    pub dir: TempDir,
}

/// Wire a full server state around stub agent + stub speech and start the
/// child.
pub async fn harness_with(transcript: &str, allowed_nodes: &[&str]) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let agent_script = write_echo_agent(dir.path());
    let mut settings = test_settings(&agent_script, dir.path());
    settings.allowed_nodes = allowed_nodes.iter().map(|s| s.to_string()).collect();

    let bus = EventBus::new(settings.limits.event_buffer);
    let state_handle = voice_relay::state::spawn(bus.clone(), settings.limits.chat_ring);
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
    let (agent, _exit_rx) = AgentProcess::new(
        AgentConfig::from_settings(&settings.agent, &settings.work_dir),
        state_handle.clone(),
    );
    agent.start().await.unwrap();

    let relay = Relay::new(
        agent,
        broker,
        Arc::new(StubSpeech { transcript: transcript.to_string() }),
        audio,
        turns,
        state_handle,
        config_store,
        DedupGuard::new(Duration::from_millis(settings.limits.cooldown_ms)),
    );

    let settings = Arc::new(settings);
    let state = ServerState {
        relay: relay.clone(),
        bus,
        auth: PeerAuth::new(&settings.allowed_nodes, dir.path().join("no-daemon.sock")),
        settings,
    };

    TestHarness { state, relay, dir }
}

pub async fn harness(transcript: &str) -> TestHarness {
    harness_with(transcript, &[]).await
}
