//! Token estimates for deciding whether a text needs chunking.

use serde::Serialize;
use toolweave_core::token::{estimate_tokens, tokens_for_chars};

/// Context size above which a text cannot be sent in one request.
pub const CONTEXT_LIMIT_TOKENS: usize = 131_072;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EstimateReport {
    pub char_count: usize,
    pub estimated_tokens: usize,
    pub exceeds_limit: bool,
    pub recommended_chunks: usize,
}

impl EstimateReport {
    /// Measure `text` against chunks of `max_chars_per_chunk` characters.
    pub fn for_text(text: &str, max_chars_per_chunk: usize) -> Self {
        let estimated_tokens = estimate_tokens(text);
        let per_chunk = tokens_for_chars(max_chars_per_chunk).max(1);
        Self {
            char_count: text.chars().count(),
            estimated_tokens,
            exceeds_limit: estimated_tokens > CONTEXT_LIMIT_TOKENS,
            recommended_chunks: estimated_tokens / per_chunk + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_fits() {
        let report = EstimateReport::for_text("hello world", 62_500);
        assert_eq!(report.char_count, 11);
        assert!(!report.exceeds_limit);
        assert_eq!(report.recommended_chunks, 1);
    }

    #[test]
    fn large_text_exceeds_limit() {
        let text = "a".repeat(400_000);
        let report = EstimateReport::for_text(&text, 62_500);
        assert_eq!(report.estimated_tokens, 160_000);
        assert!(report.exceeds_limit);
        assert_eq!(report.recommended_chunks, 7);
    }
}
