//! State aggregator.
//!
//! A single task owns every piece of public-facing state (status, chat
//! ring, pending prompt, usage, connected clients). All mutations arrive
//! as commands on one channel, so readers only ever see a snapshot that
//! was true at some instant, and the event bus sees mutations in the order
//! they were accepted.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::types::{ChatMessage, ClientSummary, Prompt, Role, Status, Usage};

/// Point-in-time view handed to new subscribers and `/api/chat`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub status: Status,
    pub recent_chat: Vec<ChatMessage>,
    pub prompt: Option<Prompt>,
    pub usage: Option<Usage>,
    pub clients: Vec<ClientSummary>,
}

enum Command {
    SetStatus(Status),
    AppendChat { role: Role, content: String },
    TextChunk { turn_id: String, text: String },
    ToolInvoked { name: String, summary: String },
    PostPrompt(Prompt),
    ResolvePrompt { id: String },
    SetUsage(Usage),
    ClientConnected(ClientSummary),
    ClientDisconnected { id: String },
    Error { turn_id: Option<String>, kind: String, message: String },
    Snapshot(oneshot::Sender<Snapshot>),
    History { since: Option<u64>, reply: oneshot::Sender<Vec<ChatMessage>> },
}

/// Cloneable handle posting commands to the aggregator task.
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<Command>,
}

impl StateHandle {
    pub async fn set_status(&self, status: Status) {
        self.send(Command::SetStatus(status)).await;
    }

    pub async fn append_user(&self, content: String) {
        self.send(Command::AppendChat { role: Role::User, content }).await;
    }

    pub async fn append_assistant(&self, content: String) {
        self.send(Command::AppendChat { role: Role::Assistant, content }).await;
    }

    pub async fn text_chunk(&self, turn_id: String, text: String) {
        self.send(Command::TextChunk { turn_id, text }).await;
    }

    pub async fn tool_invoked(&self, name: String, summary: String) {
        self.send(Command::ToolInvoked { name, summary }).await;
    }

    pub async fn post_prompt(&self, prompt: Prompt) {
        self.send(Command::PostPrompt(prompt)).await;
    }

    pub async fn resolve_prompt(&self, id: String) {
        self.send(Command::ResolvePrompt { id }).await;
    }

    pub async fn set_usage(&self, usage: Usage) {
        self.send(Command::SetUsage(usage)).await;
    }

    pub async fn client_connected(&self, client: ClientSummary) {
        self.send(Command::ClientConnected(client)).await;
    }

    pub async fn client_disconnected(&self, id: String) {
        self.send(Command::ClientDisconnected { id }).await;
    }

    pub async fn error(&self, turn_id: Option<String>, kind: &str, message: String) {
        self.send(Command::Error { turn_id, kind: kind.to_string(), message }).await;
    }

    /// Current state; falls back to an empty idle snapshot if the
    /// aggregator is gone (only during shutdown).
    pub async fn snapshot(&self) -> Snapshot {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await;
        match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => {
                warn!("state aggregator unavailable, returning empty snapshot");
                Snapshot {
                    status: Status::Idle,
                    recent_chat: Vec::new(),
                    prompt: None,
                    usage: None,
                    clients: Vec::new(),
                }
            }
        }
    }

    /// Chat history, optionally only messages with `id > since`.
    pub async fn history(&self, since: Option<u64>) -> Vec<ChatMessage> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::History { since, reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    async fn send(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            warn!("state aggregator channel closed");
        }
    }
}

struct Aggregator {
    bus: EventBus,
    status: Status,
    ring: VecDeque<ChatMessage>,
    ring_capacity: usize,
    next_message_id: u64,
    prompt: Option<Prompt>,
    usage: Option<Usage>,
    clients: Vec<ClientSummary>,
}

/// Spawn the aggregator task. Returns the command handle.
pub fn spawn(bus: EventBus, ring_capacity: usize) -> StateHandle {
    let (tx, mut rx) = mpsc::channel(256);
    let mut agg = Aggregator {
        bus,
        status: Status::Idle,
        ring: VecDeque::with_capacity(ring_capacity),
        ring_capacity: ring_capacity.max(1),
        next_message_id: 1,
        prompt: None,
        usage: None,
        clients: Vec::new(),
    };

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            agg.handle(command);
        }
        debug!("state aggregator stopped");
    });

    StateHandle { tx }
}

impl Aggregator {
    fn handle(&mut self, command: Command) {
        match command {
            Command::SetStatus(status) => {
                if self.status != status {
                    self.status = status;
                    self.bus.publish(Event::StateChanged { status });
                }
            }
            Command::AppendChat { role, content } => {
                let message = ChatMessage {
                    id: self.next_message_id,
                    role,
                    content,
                    timestamp: chrono::Utc::now(),
                };
                self.next_message_id += 1;
                if self.ring.len() == self.ring_capacity {
                    self.ring.pop_front();
                }
                self.ring.push_back(message.clone());
                self.bus.publish(Event::ChatAppended { message });
            }
            Command::TextChunk { turn_id, text } => {
                self.bus.publish(Event::TextChunk { turn_id, text });
            }
            Command::ToolInvoked { name, summary } => {
                self.bus.publish(Event::ToolInvoked { name, summary });
            }
            Command::PostPrompt(prompt) => {
                if let Some(old) = &self.prompt {
                    warn!("replacing unresolved prompt {}", old.id);
                }
                self.prompt = Some(prompt.clone());
                self.bus.publish(Event::PromptPosted { prompt });
            }
            Command::ResolvePrompt { id } => {
                if self.prompt.as_ref().map(|p| p.id == id).unwrap_or(false) {
                    self.prompt = None;
                    self.bus.publish(Event::PromptResolved { id });
                }
            }
            Command::SetUsage(usage) => {
                self.usage = Some(usage);
                self.bus.publish(Event::UsageUpdated {
                    total_in: usage.total_in,
                    total_out: usage.total_out,
                    total_context: usage.total_context,
                    context_window: usage.context_window,
                    cost: usage.cost,
                });
            }
            Command::ClientConnected(client) => {
                self.clients.retain(|c| c.id != client.id);
                self.clients.push(client);
                self.bus.publish(Event::ClientsChanged { clients: self.clients.clone() });
            }
            Command::ClientDisconnected { id } => {
                let before = self.clients.len();
                self.clients.retain(|c| c.id != id);
                if self.clients.len() != before {
                    self.bus.publish(Event::ClientsChanged { clients: self.clients.clone() });
                }
            }
            Command::Error { turn_id, kind, message } => {
                self.bus.publish(Event::Error { turn_id, kind, message });
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Snapshot {
                    status: self.status,
                    recent_chat: self.ring.iter().cloned().collect(),
                    prompt: self.prompt.clone(),
                    usage: self.usage,
                    clients: self.clients.clone(),
                });
            }
            Command::History { since, reply } => {
                let messages = match since {
                    Some(last_seen) => {
                        self.ring.iter().filter(|m| m.id > last_seen).cloned().collect()
                    }
                    None => self.ring.iter().cloned().collect(),
                };
                let _ = reply.send(messages);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (EventBus, StateHandle) {
        let bus = EventBus::new(64);
        let handle = spawn(bus.clone(), 3);
        (bus, handle)
    }

    #[tokio::test]
    async fn test_status_change_publishes_once() {
        let (bus, state) = setup();
        let mut sub = bus.subscribe();

        state.set_status(Status::Thinking).await;
        state.set_status(Status::Thinking).await;
        state.set_status(Status::Idle).await;

        match sub.recv().await.unwrap() {
            Event::StateChanged { status } => assert_eq!(status, Status::Thinking),
            other => panic!("unexpected event: {:?}", other),
        }
        match sub.recv().await.unwrap() {
            Event::StateChanged { status } => assert_eq!(status, Status::Idle),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_ring_evicts_fifo() {
        let (_bus, state) = setup();
        for i in 0..5 {
            state.append_user(format!("m{}", i)).await;
        }

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.recent_chat.len(), 3);
        assert_eq!(snapshot.recent_chat[0].content, "m2");
        assert_eq!(snapshot.recent_chat[2].content, "m4");
        // Ids keep increasing monotonically across evictions.
        assert!(snapshot.recent_chat.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_history_since_resumes_by_id() {
        let (_bus, state) = setup();
        state.append_user("a".to_string()).await;
        state.append_assistant("b".to_string()).await;

        let all = state.history(None).await;
        assert_eq!(all.len(), 2);
        let since = state.history(Some(all[0].id)).await;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].content, "b");
    }

    #[tokio::test]
    async fn test_prompt_post_and_resolve() {
        let (bus, state) = setup();
        let mut sub = bus.subscribe();

        let prompt = Prompt {
            id: "p1".to_string(),
            kind: crate::types::PromptKind::AgentPrompt,
            title: None,
            context: None,
            question: "continue?".to_string(),
            options: Vec::new(),
            deadline: None,
            permission_request_id: None,
        };
        state.post_prompt(prompt).await;
        assert!(state.snapshot().await.prompt.is_some());

        state.resolve_prompt("p1".to_string()).await;
        assert!(state.snapshot().await.prompt.is_none());

        assert!(matches!(sub.recv().await.unwrap(), Event::PromptPosted { .. }));
        assert!(matches!(sub.recv().await.unwrap(), Event::PromptResolved { .. }));
    }

    #[tokio::test]
    async fn test_client_roster() {
        let (_bus, state) = setup();
        let client = ClientSummary {
            id: "c1".to_string(),
            kind: crate::types::ClientKind::Watch,
            peer_identity: None,
            subscribed_at: chrono::Utc::now(),
        };
        state.client_connected(client).await;
        assert_eq!(state.snapshot().await.clients.len(), 1);

        state.client_disconnected("c1".to_string()).await;
        assert!(state.snapshot().await.clients.is_empty());
    }
}
