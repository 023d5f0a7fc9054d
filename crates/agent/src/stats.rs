//! Per-chat token and call accounting.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use toolweave_core::provider::Usage;

/// Snapshot attached to `complete` and `error` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub api_calls: u32,
    pub tool_calls: u32,
    pub elapsed_secs: f64,
}

/// Mutable counterpart owned by one run of the loop.
#[derive(Debug)]
pub struct StatsTracker {
    stats: TokenStats,
    started: Instant,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            stats: TokenStats::default(),
            started: Instant::now(),
        }
    }

    /// Record one completed provider round.
    ///
    /// Usage reported by the provider wins over the local estimates.
    pub fn record_call(&mut self, estimated_prompt: usize, estimated_completion: usize, usage: Option<Usage>) {
        let (prompt, completion) = match usage {
            Some(u) => (u.prompt_tokens as usize, u.completion_tokens as usize),
            None => (estimated_prompt, estimated_completion),
        };
        self.stats.api_calls += 1;
        self.stats.prompt_tokens += prompt;
        self.stats.completion_tokens += completion;
        self.stats.total_tokens = self.stats.prompt_tokens + self.stats.completion_tokens;
    }

    pub fn record_tool_call(&mut self) {
        self.stats.tool_calls += 1;
    }

    pub fn snapshot(&self) -> TokenStats {
        TokenStats {
            elapsed_secs: (self.started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
            ..self.stats
        }
    }
}
