//! Events streamed to the caller during a chat.
//!
//! Serialized with a `type` tag so a front end can forward them as SSE or
//! WebSocket frames unchanged:
//! - `think`: reasoning text or a loop notice
//! - `say`: answer text (partial while streaming)
//! - `tool_call`: a tool is about to run (arguments redacted)
//! - `tool_result`: the tool finished (display truncated, redacted)
//! - `process_info`: retries, chunking and other progress notes
//! - `complete`: final answer plus stats
//! - `error`: the run failed, plus stats

use serde::{Deserialize, Serialize};

use crate::stats::TokenStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Think {
        content: String,
    },

    Say {
        content: String,
        partial: bool,
    },

    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        result: String,
        success: bool,
    },

    ProcessInfo {
        message: String,
    },

    Complete {
        think: String,
        say: String,
        stats: TokenStats,
    },

    Error {
        message: String,
        stats: TokenStats,
    },
}

impl ChatEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Think { .. } => "think",
            Self::Say { .. } => "say",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ProcessInfo { .. } => "process_info",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this is the last event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}
