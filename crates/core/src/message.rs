//! Message domain types.
//!
//! A chat run is an append-only list of these: the system prompt, the user's
//! prompt, assistant turns (optionally carrying tool calls) and the tool
//! results that answer them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content. Empty for assistant turns that only call tools.
    pub content: String,

    /// Tool calls requested by the assistant, in emission order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// For tool results: the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Create an assistant message that records the tool calls of one turn.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// A tool invocation requested by the model.
///
/// Assembled from streamed fragments; `arguments` is only valid JSON once
/// the stream segment for the turn has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned ID, unique within one assistant turn
    pub id: String,

    /// Namespaced tool name (`<service>_<function>`)
    pub name: String,

    /// Arguments as a JSON string
    pub arguments: String,
}

/// Checks that every tool message answers a call from the assistant turn
/// directly before it (sibling tool messages may sit in between).
pub fn tool_links_are_valid(messages: &[Message]) -> bool {
    let mut open: Vec<&str> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::Assistant => {
                open = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            }
            Role::Tool => {
                let Some(id) = msg.tool_call_id.as_deref() else {
                    return false;
                };
                if !open.contains(&id) {
                    return false;
                }
            }
            Role::User | Role::System => open.clear(),
        }
    }
    true
}
