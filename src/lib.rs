//! Voice-to-agent relay server.
//!
//! A long-lived relay between voice/text clients and a persistent
//! interactive coding-agent subprocess:
//! - transcription and synthesis via an external speech API
//! - a state machine driving the child over newline-delimited JSON
//! - out-of-band tool-permission brokering with operator decisions
//! - live fan-out of state, chat, prompts, and usage over WebSocket
//! - per-connection peer authorisation against the local node daemon

pub mod agent;
pub mod audio_store;
pub mod broker;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod events;
pub mod server;
pub mod speech;
pub mod state;
pub mod turns;
pub mod types;

// Re-export the types most callers need.
pub use coordinator::{Intake, Relay};
pub use error::ApiError;
pub use events::{Event, EventBus};
pub use server::{run as run_server, ServerState};
pub use types::{ResponseMode, Status};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
