//! The orchestration loop of toolweave.
//!
//! A chat follows a **Request → Stream → Execute** cycle:
//!
//! 1. **Select** skills for the prompt and assemble the visible tool schemas
//! 2. **Compress** the history if it outgrew its token budget
//! 3. **Stream** the model's turn, splitting `<think>` reasoning from the answer
//! 4. **If tool calls**: run them through the plugin registry, divert
//!    oversized results into the chunk store, append results, loop back to 2
//! 5. **If text only**: finish with a `complete` event
//!
//! The loop also stops when the tool round limit is reached, after asking
//! the model for a summary.

pub mod context;
pub mod events;
pub mod orchestrator;
pub mod prompt;
pub mod redact;
pub mod retry;
pub mod skills;
pub mod stats;
pub mod stream_parser;

#[cfg(test)]
mod test_helpers;

pub use context::{ContextManager, estimate_history_tokens};
pub use events::ChatEvent;
pub use orchestrator::{ChatReply, ChatRequest, Orchestrator};
pub use retry::RetryPolicy;
pub use skills::{Skill, SkillCatalog};
pub use stats::{StatsTracker, TokenStats};
pub use stream_parser::{ParsedDelta, TextPiece, ThinkSplitter, ToolCallAssembler, TurnParser};
