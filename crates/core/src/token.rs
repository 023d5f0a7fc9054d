//! Token estimation utilities.
//!
//! Uses a character-based heuristic of 2.5 characters per token, which
//! holds up for mixed CJK/English payloads where the common 4-chars rule
//! badly undercounts.

use crate::message::Message;
use crate::tool::ToolSchema;

/// Characters per token used by every estimate in the workspace.
pub const CHARS_PER_TOKEN: f64 = 2.5;

/// Per-message overhead for role names and wire delimiters.
const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

/// Estimate the token count for a known character count. Rounds up.
pub fn tokens_for_chars(chars: usize) -> usize {
    // chars / 2.5 == chars * 2 / 5
    (chars * 2).div_ceil(5)
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
        .sum();
    MESSAGE_OVERHEAD + estimate_tokens(&message.content) + calls
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a slice of tool schemas (serialized as JSON).
pub fn estimate_tools_tokens(tools: &[ToolSchema]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}
