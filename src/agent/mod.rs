//! Agent subprocess: wire protocol and process mediator.

pub mod process;
pub mod protocol;

pub use process::{AgentConfig, AgentProcess, AgentState, ExitNotice, SubmitError, TurnOutcome};
pub use protocol::AgentEvent;
