//! In-process event bus.
//!
//! A broadcast channel of typed events. Every subscriber gets an
//! independently buffered queue; a slow subscriber skips its oldest
//! events and counts the loss instead of stalling the publisher.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{
    ChatMessage, ClientSummary, PermissionDecision, PermissionRequest, Prompt, Status,
};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Everything the server broadcasts to subscribed clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        status: Status,
    },
    ChatAppended {
        message: ChatMessage,
    },
    HistorySnapshot {
        messages: Vec<ChatMessage>,
    },
    PromptPosted {
        prompt: Prompt,
    },
    PromptResolved {
        id: String,
    },
    PermissionPosted {
        request: PermissionRequest,
    },
    PermissionResolved {
        id: String,
        decision: PermissionDecision,
    },
    UsageUpdated {
        total_in: u64,
        total_out: u64,
        total_context: u64,
        context_window: u64,
        cost: f64,
    },
    TextChunk {
        turn_id: String,
        text: String,
    },
    ToolInvoked {
        name: String,
        summary: String,
    },
    ClientsChanged {
        clients: Vec<ClientSummary>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
        kind: String,
        message: String,
    },
}

/// Handle for publishing events and creating subscriptions.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every live subscription. Never blocks; having no
    /// subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl Subscription {
    /// Next event in publication order. When the subscriber has fallen
    /// behind, the oldest events are skipped and counted; `None` means the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    debug!("slow event subscriber dropped {} events ({} total)", n, self.dropped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// How many events this subscriber has lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
