//! History compression.
//!
//! When the running conversation outgrows its token budget, oversized tool
//! results are swapped for small JSON stand-ins that keep enough metadata
//! (token count, chunk id, top-level keys, a preview) for the model to fetch
//! the data again if it needs it. Nothing else in the history changes.

use serde_json::{Map, Value, json};
use toolweave_core::message::{Message, Role};
use toolweave_core::token::{estimate_messages_tokens, estimate_tokens};
use tracing::info;

const PREVIEW_CHARS: usize = 200;
const MAX_KEYS: usize = 10;

/// Estimated tokens of the whole history, per-message overhead included.
pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    estimate_messages_tokens(messages)
}

/// Budget-driven compressor for tool results.
#[derive(Debug, Clone, Copy)]
pub struct ContextManager {
    budget_tokens: usize,
    threshold_tokens: usize,
}

impl ContextManager {
    pub fn new(budget_tokens: usize, threshold_tokens: usize) -> Self {
        Self {
            budget_tokens,
            threshold_tokens,
        }
    }

    pub fn budget_tokens(&self) -> usize {
        self.budget_tokens
    }

    /// Return the history unchanged if it fits the budget, otherwise with
    /// every tool message above the threshold replaced by a stand-in.
    pub fn compress(&self, messages: &[Message]) -> Vec<Message> {
        let before = estimate_history_tokens(messages);
        if before <= self.budget_tokens {
            return messages.to_vec();
        }

        let mut replaced = 0usize;
        let out: Vec<Message> = messages
            .iter()
            .map(|msg| {
                if msg.role != Role::Tool {
                    return msg.clone();
                }
                let tokens = estimate_tokens(&msg.content);
                if tokens <= self.threshold_tokens || is_stand_in(&msg.content) {
                    return msg.clone();
                }
                replaced += 1;
                let mut compact = msg.clone();
                compact.content = stand_in(&msg.content, tokens).to_string();
                compact
            })
            .collect();

        info!(
            before,
            after = estimate_history_tokens(&out),
            replaced,
            "Compressed conversation history"
        );
        out
    }
}

fn is_stand_in(content: &str) -> bool {
    serde_json::from_str::<Value>(content)
        .ok()
        .and_then(|v| v.get("compressed").and_then(Value::as_bool))
        .unwrap_or(false)
}

fn stand_in(content: &str, original_tokens: usize) -> Value {
    let mut out = Map::new();
    out.insert("compressed".into(), json!(true));
    out.insert("original_tokens".into(), json!(original_tokens));
    out.insert("char_count".into(), json!(content.chars().count()));

    let mut note = "Result compressed to save context.";
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(content) {
        let chunk_id = obj.get("chunk_id").and_then(Value::as_str).or_else(|| {
            obj.get("chunk_ids")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_str)
        });
        if let Some(id) = chunk_id {
            out.insert("chunk_id".into(), json!(id));
            note = "Chunk content compressed; call dataproc_get_chunk to read it again.";
        }
        let keys: Vec<&String> = obj.keys().take(MAX_KEYS).collect();
        out.insert("keys".into(), json!(keys));
    }

    let preview: String = content.chars().take(PREVIEW_CHARS).collect();
    out.insert("preview".into(), json!(preview));
    out.insert("note".into(), json!(note));
    Value::Object(out)
}
