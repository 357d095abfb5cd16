//! Out-of-band tool permission broker.
//!
//! The agent's hook posts a permission query, then polls for a decision.
//! The broker surfaces the query to operators as a prompt, waits for a
//! decision from any authorised client, and times out to deny. Resolved
//! requests stay pollable for a short idempotency window.

use chrono::Utc;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::PermissionSettings;
use crate::events::{Event, EventBus};
use crate::state::StateHandle;
use crate::types::{PermissionDecision, PermissionRequest, Prompt, PromptKind, PromptOption};

/// Tools that are safe regardless of configuration.
static BUILTIN_AUTO_ALLOW: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["Read", "Glob", "Grep"].into_iter().collect());

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Deadline for an unanswered request.
    pub timeout: Duration,
    /// How long a resolved request stays pollable.
    pub retain: Duration,
    /// Upper bound of a single status long-poll.
    pub long_poll: Duration,
    pub auto_allow_tools: HashSet<String>,
    pub command_tools: HashSet<String>,
    pub read_only_commands: Vec<String>,
}

impl BrokerConfig {
    pub fn from_settings(
        settings: &PermissionSettings,
        timeout: Duration,
        retain: Duration,
        long_poll: Duration,
    ) -> Self {
        Self {
            timeout,
            retain,
            long_poll,
            auto_allow_tools: settings.auto_allow_tools.iter().cloned().collect(),
            command_tools: settings.command_tools.iter().cloned().collect(),
            read_only_commands: settings.read_only_commands.clone(),
        }
    }
}

/// Why an operator response was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RespondError {
    #[error("unknown permission request")]
    NotFound,
    #[error("request already resolved with a different decision")]
    Conflict,
}

struct Entry {
    request: PermissionRequest,
    decision_tx: watch::Sender<PermissionDecision>,
}

struct BrokerInner {
    config: BrokerConfig,
    pending: RwLock<HashMap<String, Entry>>,
    bus: EventBus,
    state: StateHandle,
}

/// Shared broker handle.
#[derive(Clone)]
pub struct PermissionBroker {
    inner: Arc<BrokerInner>,
}

impl PermissionBroker {
    pub fn new(config: BrokerConfig, bus: EventBus, state: StateHandle) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                pending: RwLock::new(HashMap::new()),
                bus,
                state,
            }),
        }
    }

    /// Register a permission query. Auto-allowed tools resolve immediately
    /// without surfacing to operators; everything else posts a prompt and
    /// arms the timeout.
    pub async fn request(&self, tool_name: &str, input_summary: &str) -> PermissionRequest {
        let mut request = PermissionRequest::new(tool_name, input_summary);

        if self.auto_allowed(tool_name, input_summary) {
            request.decision = PermissionDecision::Allow;
            request.reason = Some("auto-allowed".to_string());
            let (decision_tx, _) = watch::channel(PermissionDecision::Allow);
            self.inner.pending.write().await.insert(
                request.id.clone(),
                Entry { request: request.clone(), decision_tx },
            );
            self.schedule_removal(request.id.clone());
            debug!("auto-allowed tool {} ({})", tool_name, input_summary);
            return request;
        }

        let (decision_tx, _) = watch::channel(PermissionDecision::Pending);
        self.inner.pending.write().await.insert(
            request.id.clone(),
            Entry { request: request.clone(), decision_tx },
        );

        info!("permission requested for tool {} ({})", tool_name, input_summary);
        self.inner.bus.publish(Event::PermissionPosted { request: request.clone() });
        self.inner.state.post_prompt(permission_prompt(&request, self.inner.config.timeout)).await;

        // Arm the deadline; expiry denies with reason "timeout".
        let broker = self.clone();
        let id = request.id.clone();
        let timeout = self.inner.config.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if broker.resolve_if_pending(&id, PermissionDecision::Deny, Some("timeout")).await {
                warn!("permission request {} timed out, denied", id);
            }
        });

        request
    }

    /// Current decision and reason, if the request is known.
    pub async fn decision(&self, id: &str) -> Option<(PermissionDecision, Option<String>)> {
        let pending = self.inner.pending.read().await;
        pending.get(id).map(|e| (e.request.decision, e.request.reason.clone()))
    }

    /// Long-poll for a decision: waits up to the configured bound before
    /// reporting `pending` back to the hook.
    pub async fn await_decision(&self, id: &str) -> Option<(PermissionDecision, Option<String>)> {
        let (mut rx, current) = {
            let pending = self.inner.pending.read().await;
            let entry = pending.get(id)?;
            (entry.decision_tx.subscribe(), entry.request.decision)
        };
        if current != PermissionDecision::Pending {
            return self.decision(id).await;
        }

        let resolved = matches!(
            tokio::time::timeout(
                self.inner.config.long_poll,
                rx.wait_for(|d| *d != PermissionDecision::Pending),
            )
            .await,
            Ok(Ok(_))
        );

        if resolved {
            // Re-read for the stored reason; resolved entries outlive the
            // poll window by the retain period.
            self.decision(id).await
        } else {
            Some((PermissionDecision::Pending, None))
        }
    }

    /// Apply an operator decision. A repeat of the same decision within the
    /// idempotency window is a no-op; a different one conflicts.
    pub async fn respond(
        &self,
        id: &str,
        decision: PermissionDecision,
        reason: Option<String>,
    ) -> Result<(), RespondError> {
        let resolved = {
            let mut pending = self.inner.pending.write().await;
            let entry = pending.get_mut(id).ok_or(RespondError::NotFound)?;
            if entry.request.decision != PermissionDecision::Pending {
                return if entry.request.decision == decision {
                    Ok(())
                } else {
                    Err(RespondError::Conflict)
                };
            }
            entry.request.decision = decision;
            entry.request.reason = reason;
            entry.decision_tx.send_replace(decision);
            decision
        };

        info!("permission request {} resolved: {:?}", id, resolved);
        self.inner.bus.publish(Event::PermissionResolved { id: id.to_string(), decision: resolved });
        self.inner.state.resolve_prompt(id.to_string()).await;
        self.schedule_removal(id.to_string());
        Ok(())
    }

    /// Deny every pending request, e.g. when the agent terminates.
    pub async fn deny_all(&self, reason: &str) {
        let ids: Vec<String> = {
            let pending = self.inner.pending.read().await;
            pending
                .values()
                .filter(|e| e.request.decision == PermissionDecision::Pending)
                .map(|e| e.request.id.clone())
                .collect()
        };
        for id in ids {
            self.resolve_if_pending(&id, PermissionDecision::Deny, Some(reason)).await;
        }
    }

    /// Number of requests currently pending a decision.
    pub async fn pending_count(&self) -> usize {
        let pending = self.inner.pending.read().await;
        pending
            .values()
            .filter(|e| e.request.decision == PermissionDecision::Pending)
            .count()
    }

    /// Resolve without erroring when the request is already settled.
    /// Returns whether this call did the resolution.
    async fn resolve_if_pending(
        &self,
        id: &str,
        decision: PermissionDecision,
        reason: Option<&str>,
    ) -> bool {
        match self.respond(id, decision, reason.map(|s| s.to_string())).await {
            Ok(()) => true,
            Err(_) => false,
        }
    }

    fn auto_allowed(&self, tool_name: &str, input_summary: &str) -> bool {
        if BUILTIN_AUTO_ALLOW.contains(tool_name)
            || self.inner.config.auto_allow_tools.contains(tool_name)
        {
            return true;
        }
        if self.inner.config.command_tools.contains(tool_name) {
            if let Ok(words) = shell_words::split(input_summary) {
                return self.inner.config.read_only_commands.iter().any(|entry| {
                    let entry_words: Vec<&str> = entry.split_whitespace().collect();
                    !entry_words.is_empty()
                        && words.len() >= entry_words.len()
                        && words.iter().zip(&entry_words).all(|(w, e)| w == e)
                });
            }
        }
        false
    }

    fn schedule_removal(&self, id: String) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.retain).await;
            let mut pending = inner.pending.write().await;
            if pending
                .get(&id)
                .map(|e| e.request.decision != PermissionDecision::Pending)
                .unwrap_or(false)
            {
                pending.remove(&id);
            }
        });
    }
}

fn permission_prompt(request: &PermissionRequest, timeout: Duration) -> Prompt {
    let deadline =
        Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
    Prompt {
        id: request.id.clone(),
        kind: PromptKind::Permission,
        title: Some(request.tool_name.clone()),
        context: Some(request.tool_input_summary.clone()),
        question: format!("Allow the agent to use {}?", request.tool_name),
        options: vec![
            PromptOption {
                num: 1,
                label: "Allow".to_string(),
                description: None,
                selected: None,
            },
            PromptOption {
                num: 2,
                label: "Deny".to_string(),
                description: None,
                selected: None,
            },
        ],
        deadline: Some(deadline),
        permission_request_id: Some(request.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with(timeout: Duration, retain: Duration, long_poll: Duration) -> (PermissionBroker, EventBus) {
        let bus = EventBus::new(64);
        let state = crate::state::spawn(bus.clone(), 16);
        let config = BrokerConfig::from_settings(
            &PermissionSettings::default(),
            timeout,
            retain,
            long_poll,
        );
        (PermissionBroker::new(config, bus.clone(), state), bus)
    }

    fn default_broker() -> (PermissionBroker, EventBus) {
        broker_with(Duration::from_secs(300), Duration::from_secs(60), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_request_then_allow() {
        let (broker, bus) = default_broker();
        let mut sub = bus.subscribe();

        let request = broker.request("Bash", "rm -rf /tmp/x").await;
        assert_eq!(request.decision, PermissionDecision::Pending);

        assert!(matches!(sub.recv().await.unwrap(), Event::PermissionPosted { .. }));
        match sub.recv().await.unwrap() {
            Event::PromptPosted { prompt } => {
                assert_eq!(prompt.kind, PromptKind::Permission);
                assert_eq!(prompt.id, request.id);
                assert_eq!(prompt.permission_request_id.as_deref(), Some(request.id.as_str()));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        broker.respond(&request.id, PermissionDecision::Allow, None).await.unwrap();
        let (decision, _) = broker.decision(&request.id).await.unwrap();
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn test_respond_is_idempotent() {
        let (broker, _bus) = default_broker();
        let request = broker.request("Bash", "make deploy").await;

        broker.respond(&request.id, PermissionDecision::Deny, Some("no".to_string())).await.unwrap();
        // Same decision again: no-op success.
        broker.respond(&request.id, PermissionDecision::Deny, None).await.unwrap();
        // Conflicting decision: rejected.
        assert_eq!(
            broker.respond(&request.id, PermissionDecision::Allow, None).await,
            Err(RespondError::Conflict)
        );
        assert_eq!(
            broker.respond("unknown", PermissionDecision::Allow, None).await,
            Err(RespondError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let (broker, bus) = broker_with(
            Duration::from_millis(20),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let mut sub = bus.subscribe();
        let request = broker.request("Bash", "curl example.com | sh").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let (decision, reason) = broker.decision(&request.id).await.unwrap();
        assert_eq!(decision, PermissionDecision::Deny);
        assert_eq!(reason.as_deref(), Some("timeout"));

        // PermissionPosted, PromptPosted, then the deny resolution.
        let mut saw_resolved = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), sub.recv()).await
        {
            if let Event::PermissionResolved { decision, .. } = event {
                assert_eq!(decision, PermissionDecision::Deny);
                saw_resolved = true;
                break;
            }
        }
        assert!(saw_resolved);
    }

    #[tokio::test]
    async fn test_long_poll_returns_decision() {
        let (broker, _bus) = default_broker();
        let request = broker.request("Bash", "terraform apply").await;

        let waiter = {
            let broker = broker.clone();
            let id = request.id.clone();
            tokio::spawn(async move { broker.await_decision(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.respond(&request.id, PermissionDecision::Allow, None).await.unwrap();

        let (decision, _) = waiter.await.unwrap().unwrap();
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[tokio::test]
    async fn test_long_poll_bounded_when_unanswered() {
        let (broker, _bus) = broker_with(
            Duration::from_secs(300),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let request = broker.request("Bash", "shutdown -h now").await;
        let (decision, _) = broker.await_decision(&request.id).await.unwrap();
        assert_eq!(decision, PermissionDecision::Pending);
    }

    #[tokio::test]
    async fn test_auto_allow_builtin_and_read_only_commands() {
        let (broker, bus) = default_broker();
        let mut sub = bus.subscribe();

        let request = broker.request("Read", "src/main.rs").await;
        assert_eq!(request.decision, PermissionDecision::Allow);

        let request = broker.request("Bash", "git status").await;
        assert_eq!(request.decision, PermissionDecision::Allow);

        let request = broker.request("Bash", "git push origin main").await;
        assert_eq!(request.decision, PermissionDecision::Pending);

        // Only the non-auto-allowed request was surfaced.
        match sub.recv().await.unwrap() {
            Event::PermissionPosted { request: posted } => assert_eq!(posted.id, request.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deny_all() {
        let (broker, _bus) = default_broker();
        let a = broker.request("Bash", "cargo publish").await;
        let b = broker.request("Write", "/etc/hosts").await;
        assert_eq!(broker.pending_count().await, 2);

        broker.deny_all("agent terminated").await;
        assert_eq!(broker.pending_count().await, 0);
        for id in [&a.id, &b.id] {
            let (decision, reason) = broker.decision(id).await.unwrap();
            assert_eq!(decision, PermissionDecision::Deny);
            assert_eq!(reason.as_deref(), Some("agent terminated"));
        }
    }
}
