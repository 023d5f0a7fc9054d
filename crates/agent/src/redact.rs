//! Masking of credentials in tool arguments and results before they reach
//! the event stream. The conversation history sent to the model is never
//! redacted.

use serde_json::Value;

pub const REDACTED: &str = "***REDACTED***";

const SENSITIVE: &[&str] = &["access_token", "token", "password", "secret", "api_key", "apikey"];

/// Strings at or below this many chars are never masked by content.
const MIN_MASKED_LEN: usize = 50;

fn is_sensitive(text: &str) -> bool {
    let lower = text.to_lowercase();
    SENSITIVE.iter().any(|word| lower.contains(word))
}

/// Return a copy of `value` with sensitive keys and values masked.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let masked = if is_sensitive(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) => Value::String(redact_str(s)),
        other => other.clone(),
    }
}

/// Mask a free-form string if it is long and mentions a credential.
pub fn redact_str(text: &str) -> String {
    if text.chars().count() > MIN_MASKED_LEN && is_sensitive(text) {
        REDACTED.to_string()
    } else {
        text.to_string()
    }
}

/// Redact JSON text, falling back to string masking when it is not JSON.
pub fn redact_json_text(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => redact(&value).to_string(),
        Err(_) => redact_str(text),
    }
}

/// Cut `text` to `max_chars` characters, marking the cut.
pub fn truncate_display(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => format!("{}... (truncated, {} chars total)", &text[..byte], text.chars().count()),
        None => text.to_string(),
    }
}
