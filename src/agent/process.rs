//! Agent subprocess mediator.
//!
//! Owns the single long-running child process, its stdin/stdout handles,
//! and the rendezvous between a submitted turn and its completion. No
//! other component touches the child's pipes.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::agent::protocol::{AgentEvent, OptionLine, PromptLine};
use crate::config::AgentSettings;
use crate::state::StateHandle;
use crate::types::{Prompt, PromptKind, PromptOption, Usage};

/// Lifecycle states of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentState {
    NotStarted,
    Starting,
    Ready,
    BusyThinking,
    Exited { clean: bool },
}

/// How a submitted turn ended.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Full assistant text accumulated over the turn.
    Completed { text: String },
    Aborted,
    Failed { reason: String },
}

/// Why `submit` was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("agent is busy with another turn")]
    Busy,
    #[error("agent is not ready: {0}")]
    NotReady(String),
    #[error("failed to encode prompt: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write to agent stdin: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification that the child exited on its own.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub status: Option<i32>,
}

/// How the child is launched and torn down.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub abort_window: Duration,
    pub shutdown_grace: Duration,
    pub stderr_tail_lines: usize,
}

impl AgentConfig {
    pub fn from_settings(settings: &AgentSettings, work_dir: &Path) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            work_dir: work_dir.to_path_buf(),
            abort_window: Duration::from_millis(settings.abort_window_ms),
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            stderr_tail_lines: settings.stderr_tail_lines,
        }
    }
}

struct ActiveTurn {
    turn_id: String,
    buffer: String,
    done: Option<oneshot::Sender<TurnOutcome>>,
}

struct Session {
    epoch: u64,
    state: AgentState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    active: Option<ActiveTurn>,
    terminating: bool,
}

struct Inner {
    config: AgentConfig,
    session: Mutex<Session>,
    state_tx: watch::Sender<AgentState>,
    state_handle: StateHandle,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    aborting: AtomicBool,
    stderr_tail: std::sync::Mutex<VecDeque<String>>,
}

/// Handle to the agent child process.
#[derive(Clone)]
pub struct AgentProcess {
    inner: Arc<Inner>,
}

impl AgentProcess {
    /// Create the mediator. The returned receiver yields a notice whenever
    /// the child exits unexpectedly, so a supervisor can restart it.
    pub fn new(
        config: AgentConfig,
        state_handle: StateHandle,
    ) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(AgentState::NotStarted);
        let process = Self {
            inner: Arc::new(Inner {
                config,
                session: Mutex::new(Session {
                    epoch: 0,
                    state: AgentState::NotStarted,
                    child: None,
                    stdin: None,
                    active: None,
                    terminating: false,
                }),
                state_tx,
                state_handle,
                exit_tx,
                aborting: AtomicBool::new(false),
                stderr_tail: std::sync::Mutex::new(VecDeque::new()),
            }),
        };
        (process, exit_rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state_tx.subscribe()
    }

    /// The child's most recent stderr lines, newest last.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.inner.stderr_tail.lock().unwrap().iter().cloned().collect()
    }

    /// Spawn the child and its reader tasks.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        if session.child.is_some() {
            bail!("agent child is already running");
        }
        set_state(&self.inner, &mut session, AgentState::Starting);

        let mut command = Command::new(&self.inner.config.command);
        command
            .args(&self.inner.config.args)
            .current_dir(&self.inner.config.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                set_state(&self.inner, &mut session, AgentState::Exited { clean: false });
                return Err(err).with_context(|| {
                    format!("Failed to spawn agent command '{}'", self.inner.config.command)
                });
            }
        };

        let stdout = child.stdout.take().context("agent child has no stdout")?;
        let stderr = child.stderr.take().context("agent child has no stderr")?;
        let stdin = child.stdin.take().context("agent child has no stdin")?;

        session.epoch += 1;
        let epoch = session.epoch;
        session.child = Some(child);
        session.stdin = Some(stdin);
        session.active = None;
        session.terminating = false;
        set_state(&self.inner, &mut session, AgentState::Ready);
        drop(session);

        info!("agent child started (command: {})", self.inner.config.command);

        tokio::spawn(read_stdout(self.inner.clone(), stdout, epoch));
        tokio::spawn(read_stderr(self.inner.clone(), stderr));
        Ok(())
    }

    /// Write one prompt line to the child. Returns a receiver that resolves
    /// when the turn completes, aborts, or fails.
    pub async fn submit(
        &self,
        turn_id: &str,
        text: &str,
    ) -> Result<oneshot::Receiver<TurnOutcome>, SubmitError> {
        let mut session = self.inner.session.lock().await;
        match session.state {
            AgentState::Ready => {}
            AgentState::BusyThinking => return Err(SubmitError::Busy),
            other => return Err(SubmitError::NotReady(format!("{:?}", other))),
        }
        let line = serde_json::to_string(&PromptLine { turn_id, text })?;
        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| SubmitError::NotReady("child stdin closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        let (done_tx, done_rx) = oneshot::channel();
        session.active = Some(ActiveTurn {
            turn_id: turn_id.to_string(),
            buffer: String::new(),
            done: Some(done_tx),
        });
        set_state(&self.inner, &mut session, AgentState::BusyThinking);
        debug!("submitted turn {} to agent", turn_id);
        Ok(done_rx)
    }

    /// Relay an operator's option choice for the active interactive prompt.
    pub async fn respond_option(&self, option: u32) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        let turn_id = match session.active.as_ref() {
            Some(active) => active.turn_id.clone(),
            None => bail!("no active turn to respond to"),
        };
        let line = serde_json::to_string(&OptionLine { turn_id: &turn_id, option })?;
        let stdin = session.stdin.as_mut().context("child stdin closed")?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Cancel the current turn. Sends SIGINT, waits a bounded window for
    /// the child's own `message_end`/`aborted`, then forces the turn
    /// closed. A second abort while one is draining is a no-op. Returns
    /// whether a turn was actually aborted.
    pub async fn abort(&self) -> Result<bool> {
        if self.inner.aborting.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.abort_inner().await;
        self.inner.aborting.store(false, Ordering::SeqCst);
        result
    }

    async fn abort_inner(&self) -> Result<bool> {
        let pid = {
            let session = self.inner.session.lock().await;
            if session.state != AgentState::BusyThinking {
                return Ok(false);
            }
            session.child.as_ref().and_then(|c| c.id())
        };
        if let Some(pid) = pid {
            signal(pid, libc::SIGINT);
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        let drained = matches!(
            tokio::time::timeout(
                self.inner.config.abort_window,
                state_rx.wait_for(|s| !matches!(s, AgentState::BusyThinking)),
            )
            .await,
            Ok(Ok(_))
        );

        if !drained {
            // The child did not wind the turn down itself; force it.
            let mut session = self.inner.session.lock().await;
            if let Some(mut active) = session.active.take() {
                active.buffer.clear();
                if let Some(tx) = active.done.take() {
                    let _ = tx.send(TurnOutcome::Aborted);
                }
            }
            if session.state == AgentState::BusyThinking {
                set_state(&self.inner, &mut session, AgentState::Ready);
            }
            warn!("abort window expired, turn forced closed");
        }
        Ok(true)
    }

    /// Terminate the child: SIGTERM, bounded grace, then SIGKILL. The
    /// active turn (if any) fails.
    pub async fn terminate(&self) -> Result<()> {
        let (child, active) = {
            let mut session = self.inner.session.lock().await;
            session.terminating = true;
            session.stdin = None;
            let child = session.child.take();
            let active = session.active.take();
            set_state(&self.inner, &mut session, AgentState::Exited { clean: true });
            (child, active)
        };

        if let Some(mut active) = active {
            if let Some(tx) = active.done.take() {
                let _ = tx.send(TurnOutcome::Failed {
                    reason: "agent terminated".to_string(),
                });
            }
        }

        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                signal(pid, libc::SIGTERM);
            }
            match tokio::time::timeout(self.inner.config.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!("agent child exited: {}", status),
                Ok(Err(err)) => warn!("failed to reap agent child: {}", err),
                Err(_) => {
                    warn!("agent child ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }

    /// Terminate and relaunch.
    pub async fn restart(&self) -> Result<()> {
        info!("restarting agent child");
        self.terminate().await?;
        self.start().await
    }
}

fn set_state(inner: &Inner, session: &mut Session, state: AgentState) {
    session.state = state;
    inner.state_tx.send_replace(state);
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

async fn read_stdout(inner: Arc<Inner>, stdout: ChildStdout, epoch: u64) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&inner, epoch, &line).await,
            Ok(None) => break,
            Err(err) => {
                warn!("error reading agent stdout: {}", err);
                break;
            }
        }
    }
    on_child_exit(&inner, epoch).await;
}

async fn read_stderr(inner: Arc<Inner>, stderr: ChildStderr) {
    let cap = inner.config.stderr_tail_lines.max(1);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("agent stderr: {}", line);
        let mut tail = inner.stderr_tail.lock().unwrap();
        if tail.len() == cap {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// What to do after releasing the session lock for one stdout event.
enum After {
    None,
    TextChunk { turn_id: String, delta: String },
    ToolUse { name: String, summary: String },
    Completed { text: String, done: Option<oneshot::Sender<TurnOutcome>> },
    Prompt(Prompt),
    Usage(Usage),
    Aborted { done: Option<oneshot::Sender<TurnOutcome>> },
}

async fn handle_line(inner: &Arc<Inner>, epoch: u64, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let event = match AgentEvent::parse(trimmed) {
        Ok(event) => event,
        Err(err) => {
            warn!("skipping malformed agent event: {} ({})", err, preview(trimmed));
            return;
        }
    };

    let after = {
        let mut session = inner.session.lock().await;
        if session.epoch != epoch {
            return;
        }
        match event {
            AgentEvent::TextChunk { turn_id, delta } => {
                if let Some(active) = session.active.as_mut() {
                    if active.turn_id == turn_id {
                        active.buffer.push_str(&delta);
                    }
                }
                After::TextChunk { turn_id, delta }
            }
            AgentEvent::ToolUse { name, summary } => After::ToolUse { name, summary },
            AgentEvent::MessageEnd { turn_id } => match session.active.take() {
                Some(mut active) => {
                    if active.turn_id != turn_id {
                        warn!(
                            "message_end for turn {} while turn {} is active",
                            turn_id, active.turn_id
                        );
                    }
                    set_state(inner, &mut session, AgentState::Ready);
                    After::Completed {
                        text: std::mem::take(&mut active.buffer),
                        done: active.done.take(),
                    }
                }
                None => {
                    debug!("message_end without an active turn");
                    After::None
                }
            },
            AgentEvent::Prompt { question, title, context, options } => {
                let options = options
                    .into_iter()
                    .map(|o| PromptOption {
                        num: o.num,
                        label: o.label,
                        description: o.description,
                        selected: None,
                    })
                    .collect();
                After::Prompt(Prompt {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: PromptKind::AgentPrompt,
                    title,
                    context,
                    question,
                    options,
                    deadline: None,
                    permission_request_id: None,
                })
            }
            AgentEvent::Usage { total_in, total_out, total_context, context_window, cost } => {
                After::Usage(Usage { total_in, total_out, total_context, context_window, cost })
            }
            AgentEvent::Aborted { turn_id } => match session.active.take() {
                Some(mut active) => {
                    debug!("agent aborted turn {}", turn_id);
                    set_state(inner, &mut session, AgentState::Ready);
                    After::Aborted { done: active.done.take() }
                }
                None => After::None,
            },
            AgentEvent::Unknown => {
                debug!("ignoring unknown agent event kind: {}", preview(trimmed));
                After::None
            }
        }
    };

    match after {
        After::None => {}
        After::TextChunk { turn_id, delta } => {
            inner.state_handle.text_chunk(turn_id, delta).await;
        }
        After::ToolUse { name, summary } => {
            inner.state_handle.tool_invoked(name, summary).await;
        }
        After::Completed { text, done } => {
            // Enqueue the chat append before waking the submitter, so the
            // assistant message always precedes the idle transition on the
            // bus.
            inner.state_handle.append_assistant(text.clone()).await;
            if let Some(tx) = done {
                let _ = tx.send(TurnOutcome::Completed { text });
            }
        }
        After::Prompt(prompt) => {
            inner.state_handle.post_prompt(prompt).await;
        }
        After::Usage(usage) => {
            inner.state_handle.set_usage(usage).await;
        }
        After::Aborted { done } => {
            if let Some(tx) = done {
                let _ = tx.send(TurnOutcome::Aborted);
            }
        }
    }
}

async fn on_child_exit(inner: &Arc<Inner>, epoch: u64) {
    let (notify, active) = {
        let mut session = inner.session.lock().await;
        if session.epoch != epoch {
            return;
        }
        let terminating = session.terminating;
        let child = session.child.take();
        session.stdin = None;
        let active = session.active.take();

        if terminating {
            (None, active)
        } else {
            let status = match child {
                Some(mut child) => child.wait().await.ok(),
                None => None,
            };
            let clean = status.map(|s| s.success()).unwrap_or(false);
            set_state(inner, &mut session, AgentState::Exited { clean });
            (Some(ExitNotice { status: status.and_then(|s| s.code()) }), active)
        }
    };

    if let Some(mut active) = active {
        if let Some(tx) = active.done.take() {
            let _ = tx.send(TurnOutcome::Failed { reason: "agent exited".to_string() });
        }
    }
    if let Some(notice) = notify {
        warn!("agent child exited unexpectedly (status: {:?})", notice.status);
        let _ = inner.exit_tx.send(notice);
    }
}

fn preview(line: &str) -> &str {
    let max = 120.min(line.len());
    let mut end = max;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_respects_char_boundaries() {
        let s = "é".repeat(100);
        let p = preview(&s);
        assert!(p.len() <= 120);
        assert!(s.starts_with(p));
    }

    #[test]
    fn test_agent_config_from_settings() {
        let settings = AgentSettings::default();
        let config = AgentConfig::from_settings(&settings, Path::new("/tmp"));
        assert_eq!(config.command, "agent");
        assert_eq!(config.abort_window, Duration::from_millis(2000));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }
}
