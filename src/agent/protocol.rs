//! Wire contract with the agent child process.
//!
//! The child reads one JSON object per line on stdin and writes one JSON
//! event per line on stdout. Unknown event kinds and unknown fields must
//! decode without error.

use serde::{Deserialize, Serialize};

/// A prompt line written to the child's stdin.
#[derive(Debug, Serialize)]
pub struct PromptLine<'a> {
    pub turn_id: &'a str,
    pub text: &'a str,
}

/// An operator option relayed back for an interactive agent prompt.
#[derive(Debug, Serialize)]
pub struct OptionLine<'a> {
    pub turn_id: &'a str,
    pub option: u32,
}

/// One option offered by an interactive agent prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePromptOption {
    pub num: u32,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Events the child emits on stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    TextChunk {
        turn_id: String,
        delta: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        summary: String,
    },
    MessageEnd {
        turn_id: String,
    },
    Prompt {
        question: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        options: Vec<WirePromptOption>,
    },
    Usage {
        #[serde(default)]
        total_in: u64,
        #[serde(default)]
        total_out: u64,
        #[serde(default)]
        total_context: u64,
        #[serde(default)]
        context_window: u64,
        #[serde(default)]
        cost: f64,
    },
    Aborted {
        turn_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Decode one stdout line.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
