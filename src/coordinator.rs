//! Turn pipeline.
//!
//! Glues intake, duplicate guarding, transcription, the agent exchange,
//! synthesis, and artifact bookkeeping together. One `Relay` value carries
//! every component and is threaded into the HTTP/WS handlers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::agent::{AgentProcess, ExitNotice, TurnOutcome};
use crate::audio_store::AudioStore;
use crate::broker::PermissionBroker;
use crate::config::ConfigStore;
use crate::dedup::{DedupGuard, GuardError, TurnPermit};
use crate::error::ApiError;
use crate::speech::{SpeechApi, SpeechError};
use crate::state::StateHandle;
use crate::turns::TurnStore;
use crate::types::{Origin, ResponseMode, Status, Turn, TurnStatus};

/// How long a resolved agent prompt keeps answering repeats as a no-op.
const PROMPT_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(60);

/// Crashes inside this window count towards the give-up threshold.
const CRASH_WINDOW: Duration = Duration::from_secs(60);
const MAX_CRASHES: usize = 3;

/// Immediate reply to an accepted submission; the agent keeps working
/// after this is returned.
#[derive(Debug, Clone)]
pub struct Intake {
    pub request_id: String,
    pub transcript: String,
    pub response_mode: ResponseMode,
}

struct RelayInner {
    agent: AgentProcess,
    broker: PermissionBroker,
    speech: Arc<dyn SpeechApi>,
    audio: Arc<AudioStore>,
    turns: Arc<TurnStore>,
    state: StateHandle,
    config: Arc<ConfigStore>,
    guard: DedupGuard,
    last_prompt_answer: std::sync::Mutex<Option<(u32, Instant)>>,
}

/// Root value tying the components together.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: AgentProcess,
        broker: PermissionBroker,
        speech: Arc<dyn SpeechApi>,
        audio: Arc<AudioStore>,
        turns: Arc<TurnStore>,
        state: StateHandle,
        config: Arc<ConfigStore>,
        guard: DedupGuard,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                agent,
                broker,
                speech,
                audio,
                turns,
                state,
                config,
                guard,
                last_prompt_answer: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn agent(&self) -> &AgentProcess {
        &self.inner.agent
    }

    pub fn broker(&self) -> &PermissionBroker {
        &self.inner.broker
    }

    pub fn turns(&self) -> &Arc<TurnStore> {
        &self.inner.turns
    }

    pub fn audio(&self) -> &Arc<AudioStore> {
        &self.inner.audio
    }

    pub fn state(&self) -> &StateHandle {
        &self.inner.state
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    /// Text submission: cooldown check, turn creation, agent hand-off.
    pub async fn submit_text(
        &self,
        text: &str,
        mode: Option<ResponseMode>,
    ) -> Result<Intake, ApiError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ApiError::BadRequest("empty message text".to_string()));
        }
        self.inner.guard.check_transcript(&text).map_err(guard_error)?;
        let permit = self.inner.guard.begin_turn().map_err(guard_error)?;

        let runtime = self.inner.config.get().await;
        let mode = mode.unwrap_or(runtime.response_mode);
        let mut turn = Turn::new(Origin::Text, mode);
        turn.transcript = text.clone();
        let turn_id = turn.id.clone();
        self.inner.turns.insert(turn).await;
        self.inner.state.append_user(text.clone()).await;

        let relay = self.clone();
        let spawn_text = text.clone();
        let spawn_id = turn_id.clone();
        tokio::spawn(async move {
            relay.run_turn(spawn_id, spawn_text, mode, permit).await;
        });

        Ok(Intake { request_id: turn_id, transcript: text, response_mode: mode })
    }

    /// Voice submission: the turn exists before the STT call; the
    /// transcript-equality cooldown applies once STT has returned.
    pub async fn submit_audio(
        &self,
        audio: &[u8],
        mime: &str,
        mode: Option<ResponseMode>,
    ) -> Result<Intake, ApiError> {
        if audio.is_empty() {
            return Err(ApiError::BadRequest("empty audio body".to_string()));
        }
        let permit = self.inner.guard.begin_turn().map_err(guard_error)?;

        let runtime = self.inner.config.get().await;
        let mode = mode.unwrap_or(runtime.response_mode);
        let turn = Turn::new(Origin::Voice, mode);
        let turn_id = turn.id.clone();
        self.inner.turns.insert(turn).await;
        self.inner.state.set_status(Status::Listening).await;

        let transcript = match self.inner.speech.transcribe(audio, mime, &runtime).await {
            Ok(transcript) => transcript.text,
            Err(err) => {
                warn!("transcription failed for turn {}: {}", turn_id, err);
                self.inner
                    .turns
                    .update(&turn_id, |t| t.status = TurnStatus::Failed)
                    .await;
                self.inner
                    .state
                    .error(Some(turn_id.clone()), "stt_failed", err.to_string())
                    .await;
                self.inner.state.set_status(Status::Idle).await;
                return Err(speech_error(err));
            }
        };

        self.inner
            .turns
            .update(&turn_id, |t| t.transcript = transcript.clone())
            .await;

        if transcript.is_empty() {
            // Nothing was said; record the empty user message and stop
            // without invoking the agent.
            self.inner.state.append_user(String::new()).await;
            self.inner
                .turns
                .update(&turn_id, |t| t.status = TurnStatus::Completed)
                .await;
            self.inner.state.set_status(Status::Idle).await;
            return Ok(Intake { request_id: turn_id, transcript, response_mode: mode });
        }

        if let Err(err) = self.inner.guard.check_transcript(&transcript) {
            // A duplicate is not a turn; discard it entirely.
            self.inner.turns.remove(&turn_id).await;
            self.inner.state.set_status(Status::Idle).await;
            return Err(guard_error(err));
        }

        self.inner.state.append_user(transcript.clone()).await;

        let relay = self.clone();
        let spawn_text = transcript.clone();
        let spawn_id = turn_id.clone();
        tokio::spawn(async move {
            relay.run_turn(spawn_id, spawn_text, mode, permit).await;
        });

        Ok(Intake { request_id: turn_id, transcript, response_mode: mode })
    }

    /// Drive one accepted turn through the agent and, if configured,
    /// through synthesis. Owns the in-flight permit for its whole life.
    async fn run_turn(self, turn_id: String, text: String, mode: ResponseMode, permit: TurnPermit) {
        let _permit = permit;

        let done = match self.inner.agent.submit(&turn_id, &text).await {
            Ok(done) => done,
            Err(err) => {
                warn!("turn {} rejected by agent: {}", turn_id, err);
                self.inner
                    .turns
                    .update(&turn_id, |t| t.status = TurnStatus::Failed)
                    .await;
                self.inner
                    .state
                    .error(Some(turn_id), "agent_unavailable", err.to_string())
                    .await;
                self.inner.state.set_status(Status::Idle).await;
                return;
            }
        };
        self.inner.state.set_status(Status::Thinking).await;

        let outcome = done.await.unwrap_or(TurnOutcome::Failed {
            reason: "agent connection lost".to_string(),
        });

        match outcome {
            TurnOutcome::Completed { text: reply } => {
                self.inner
                    .turns
                    .update(&turn_id, |t| t.response_text = Some(reply.clone()))
                    .await;
                match mode {
                    ResponseMode::Audio => self.finish_audio(&turn_id, &reply).await,
                    ResponseMode::Text | ResponseMode::Disabled => {
                        self.inner
                            .turns
                            .update(&turn_id, |t| t.status = TurnStatus::Completed)
                            .await;
                        self.inner.state.set_status(Status::Idle).await;
                    }
                }
            }
            TurnOutcome::Aborted => {
                info!("turn {} aborted", turn_id);
                self.inner
                    .turns
                    .update(&turn_id, |t| t.status = TurnStatus::Aborted)
                    .await;
                self.inner.state.set_status(Status::Idle).await;
            }
            TurnOutcome::Failed { reason } => {
                warn!("turn {} failed: {}", turn_id, reason);
                self.inner
                    .turns
                    .update(&turn_id, |t| t.status = TurnStatus::Failed)
                    .await;
                self.inner
                    .state
                    .error(Some(turn_id), "turn_failed", reason)
                    .await;
                self.inner.state.set_status(Status::Idle).await;
            }
        }
    }

    /// Synthesize the reply and park it in the audio store; the status
    /// stays `speaking` until the client acknowledges.
    async fn finish_audio(&self, turn_id: &str, reply: &str) {
        let runtime = self.inner.config.get().await;
        match self
            .inner
            .speech
            .synthesize(reply, &runtime.tts_voice, runtime.tts_max_chars)
            .await
        {
            Ok(audio) => {
                if let Err(err) = self.inner.audio.put(turn_id, audio.bytes, &audio.mime).await {
                    warn!("could not store audio for turn {}: {}", turn_id, err);
                    self.inner
                        .turns
                        .update(turn_id, |t| t.status = TurnStatus::Completed)
                        .await;
                    self.inner.state.set_status(Status::Idle).await;
                    return;
                }
                self.inner
                    .turns
                    .update(turn_id, |t| {
                        t.audio_artifact_id = Some(turn_id.to_string());
                        t.status = TurnStatus::Speaking;
                    })
                    .await;
                self.inner.state.set_status(Status::Speaking).await;
            }
            Err(err) => {
                // The text reply still stands; surface the synthesis
                // failure and fall back to a completed text turn.
                warn!("synthesis failed for turn {}: {}", turn_id, err);
                self.inner
                    .state
                    .error(Some(turn_id.to_string()), "tts_failed", err.to_string())
                    .await;
                self.inner
                    .turns
                    .update(turn_id, |t| t.status = TurnStatus::Completed)
                    .await;
                self.inner.state.set_status(Status::Idle).await;
            }
        }
    }

    /// Acknowledge a delivered response: evict the artifact and return to
    /// idle when the turn was speaking.
    pub async fn acknowledge(&self, turn_id: &str) -> Result<(), ApiError> {
        let turn = self
            .inner
            .turns
            .acknowledge(turn_id)
            .await
            .ok_or(ApiError::NotFound)?;
        self.inner.audio.drop_artifact(turn_id).await;
        if turn.status == TurnStatus::Speaking {
            self.inner.state.set_status(Status::Idle).await;
        }
        Ok(())
    }

    /// Abort the current turn. No-op (false) when nothing is thinking.
    pub async fn abort(&self) -> Result<bool, ApiError> {
        self.inner.agent.abort().await.map_err(ApiError::Internal)
    }

    /// Restart the child. Pending turns fail and pending permissions are
    /// denied before the relaunch.
    pub async fn restart_agent(&self) -> Result<(), ApiError> {
        info!("agent restart requested");
        self.inner.broker.deny_all("agent terminated").await;
        self.inner.turns.finish_unresolved(TurnStatus::Failed).await;
        self.inner.agent.restart().await.map_err(ApiError::Internal)?;
        self.inner.state.set_status(Status::Idle).await;
        Ok(())
    }

    /// Answer the active interactive agent prompt. A repeat of the same
    /// answer shortly after resolution is a no-op.
    pub async fn respond_prompt(&self, option: u32) -> Result<(), ApiError> {
        let snapshot = self.inner.state.snapshot().await;
        let prompt = match snapshot.prompt {
            Some(prompt) => prompt,
            None => {
                let last = self.inner.last_prompt_answer.lock().unwrap();
                if let Some((answered, at)) = *last {
                    if answered == option && at.elapsed() < PROMPT_IDEMPOTENCY_WINDOW {
                        return Ok(());
                    }
                }
                return Err(ApiError::NotFound);
            }
        };
        match prompt.kind {
            crate::types::PromptKind::AgentPrompt => {
                self.inner
                    .agent
                    .respond_option(option)
                    .await
                    .map_err(ApiError::Internal)?;
                self.inner.state.resolve_prompt(prompt.id).await;
                *self.inner.last_prompt_answer.lock().unwrap() = Some((option, Instant::now()));
                Ok(())
            }
            crate::types::PromptKind::Permission => Err(ApiError::Conflict(
                "active prompt is a permission request; use /api/permission/respond".to_string(),
            )),
        }
    }

    /// React to unexpected child exits: clean up, relaunch, give up after
    /// repeated crashes.
    pub async fn supervise(
        self,
        mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut crashes: VecDeque<Instant> = VecDeque::new();
        loop {
            tokio::select! {
                notice = exit_rx.recv() => {
                    let Some(notice) = notice else { break };
                    let now = Instant::now();
                    crashes.push_back(now);
                    while crashes
                        .front()
                        .map(|t| now.duration_since(*t) > CRASH_WINDOW)
                        .unwrap_or(false)
                    {
                        crashes.pop_front();
                    }

                    self.inner.broker.deny_all("agent terminated").await;
                    self.inner.turns.finish_unresolved(TurnStatus::Failed).await;
                    self.inner
                        .state
                        .error(None, "agent_crashed", format!("agent exited (status {:?})", notice.status))
                        .await;
                    self.inner.state.set_status(Status::Idle).await;

                    if crashes.len() >= MAX_CRASHES {
                        error!("agent crashed {} times within {:?}, giving up", crashes.len(), CRASH_WINDOW);
                        std::process::exit(crate::cli::EXIT_AGENT_FAILURE);
                    }
                    if let Err(err) = self.inner.agent.start().await {
                        error!("failed to relaunch agent: {:#}", err);
                        std::process::exit(crate::cli::EXIT_AGENT_FAILURE);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

fn guard_error(err: GuardError) -> ApiError {
    match err {
        GuardError::Cooldown { remaining_ms } => ApiError::Cooldown { cooldown_ms: remaining_ms },
        GuardError::Busy => ApiError::Busy,
    }
}

fn speech_error(err: SpeechError) -> ApiError {
    match err {
        SpeechError::Upstream { status, body } => ApiError::UpstreamSpeech { status, body },
        SpeechError::Network(err) => ApiError::Unavailable(format!("speech service unreachable: {}", err)),
        SpeechError::TooLarge { .. } => ApiError::PayloadTooLarge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::config::{PermissionSettings, RuntimeConfig};
    use crate::events::EventBus;
    use crate::speech::MockSpeechApi;
    use std::path::PathBuf;

    /// Stub agent: replies to every prompt line with one chunk and an end.
    fn write_stub_agent(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("stub-agent.sh");
        let script = concat!(
            "#!/bin/sh\n",
            "while IFS= read -r line; do\n",
            "  id=$(printf '%s' \"$line\" | sed -n 's/.*\"turn_id\":\"\\([^\"]*\\)\".*/\\1/p')\n",
            "  printf '{\"kind\":\"text_chunk\",\"turn_id\":\"%s\",\"delta\":\"hi\"}\\n' \"$id\"\n",
            "  printf '{\"kind\":\"message_end\",\"turn_id\":\"%s\"}\\n' \"$id\"\n",
            "done\n",
        );
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    async fn relay_with_stub(dir: &std::path::Path, speech: MockSpeechApi) -> Relay {
        let bus = EventBus::new(64);
        let state = crate::state::spawn(bus.clone(), 32);
        let broker = PermissionBroker::new(
            BrokerConfig::from_settings(
                &PermissionSettings::default(),
                Duration::from_secs(300),
                Duration::from_secs(60),
                Duration::from_secs(30),
            ),
            bus.clone(),
            state.clone(),
        );
        let config = crate::config::AgentSettings {
            command: write_stub_agent(dir).to_string_lossy().to_string(),
            args: Vec::new(),
            ..Default::default()
        };
        let (agent, _exit_rx) = AgentProcess::new(
            crate::agent::AgentConfig::from_settings(&config, dir),
            state.clone(),
        );
        agent.start().await.unwrap();

        Relay::new(
            agent,
            broker,
            Arc::new(speech),
            AudioStore::new(Duration::from_secs(600)),
            TurnStore::new(),
            state,
            Arc::new(ConfigStore::new(RuntimeConfig::default())),
            DedupGuard::new(Duration::from_secs(5)),
        )
    }

    async fn wait_for_status(relay: &Relay, id: &str, status: TurnStatus) -> Turn {
        for _ in 0..100 {
            if let Some(turn) = relay.turns().get(id).await {
                if turn.status == status {
                    return turn;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("turn {} never reached {:?}", id, status);
    }

    #[tokio::test]
    async fn test_text_turn_completes() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with_stub(dir.path(), MockSpeechApi::new()).await;

        let intake = relay.submit_text("hello", Some(ResponseMode::Text)).await.unwrap();
        assert_eq!(intake.transcript, "hello");

        let turn = wait_for_status(&relay, &intake.request_id, TurnStatus::Completed).await;
        assert_eq!(turn.response_text.as_deref(), Some("hi"));

        relay.agent().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_text_rejected_within_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let relay = relay_with_stub(dir.path(), MockSpeechApi::new()).await;

        let first = relay.submit_text("x", None).await;
        assert!(first.is_ok());
        match relay.submit_text("x", None).await {
            Err(ApiError::Cooldown { .. }) => {}
            other => panic!("expected cooldown, got {:?}", other.map(|i| i.request_id)),
        }

        relay.agent().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_transcript_skips_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut speech = MockSpeechApi::new();
        speech.expect_transcribe().returning(|_, _, _| {
            Ok(crate::speech::Transcript { text: String::new(), confidence: None })
        });
        let relay = relay_with_stub(dir.path(), speech).await;

        let intake = relay
            .submit_audio(&[0u8; 16], "audio/wav", Some(ResponseMode::Text))
            .await
            .unwrap();
        assert_eq!(intake.transcript, "");

        let turn = relay.turns().get(&intake.request_id).await.unwrap();
        assert_eq!(turn.status, TurnStatus::Completed);
        assert!(turn.response_text.is_none());

        relay.agent().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_turn_synthesizes_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let mut speech = MockSpeechApi::new();
        speech.expect_transcribe().returning(|_, _, _| {
            Ok(crate::speech::Transcript { text: "read me the news".to_string(), confidence: Some(0.9) })
        });
        speech.expect_synthesize().returning(|_, _, _| {
            Ok(crate::speech::SynthesizedAudio { bytes: vec![1, 2, 3], mime: "audio/mpeg".to_string() })
        });
        let relay = relay_with_stub(dir.path(), speech).await;

        let intake = relay
            .submit_audio(&[0u8; 16], "audio/m4a", Some(ResponseMode::Audio))
            .await
            .unwrap();

        let turn = wait_for_status(&relay, &intake.request_id, TurnStatus::Speaking).await;
        assert_eq!(turn.audio_artifact_id.as_deref(), Some(intake.request_id.as_str()));
        assert!(relay.audio().contains(&intake.request_id).await);

        relay.acknowledge(&intake.request_id).await.unwrap();
        assert!(!relay.audio().contains(&intake.request_id).await);
        assert!(relay.turns().get(&intake.request_id).await.is_none());

        relay.agent().terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_stt_failure_maps_to_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut speech = MockSpeechApi::new();
        speech.expect_transcribe().returning(|_, _, _| {
            Err(SpeechError::Upstream { status: 500, body: "boom".to_string() })
        });
        let relay = relay_with_stub(dir.path(), speech).await;

        match relay.submit_audio(&[0u8; 16], "audio/wav", None).await {
            Err(ApiError::UpstreamSpeech { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected upstream error, got {:?}", other.map(|i| i.request_id)),
        }

        relay.agent().terminate().await.unwrap();
    }
}
