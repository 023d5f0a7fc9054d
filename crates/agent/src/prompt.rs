//! System prompt assembly and chunking instructions.

use crate::skills::{Skill, context_for};

pub const DEFAULT_INSTRUCTIONS: &str = "You are a capable assistant. Use the provided tools to look up data and \
carry out actions instead of asking the user for credentials; authentication is injected for you.";

const CHUNK_RULES: &str = "\
## Chunked data
When a tool result says it was chunked (it carries a `task_id` and `chunk_ids`), you must process every chunk:
1. Call dataproc_get_next_chunk to fetch the next unprocessed chunk.
2. Analyse it and call dataproc_save_summary with its chunk_id; this marks the chunk as processed.
3. Repeat until dataproc_get_next_chunk reports that all chunks are done. Never stop early because a sample looks sufficient.
4. Call dataproc_merge_summaries and base the final answer on the merged summaries, covering the full range of the data.";

/// Base instructions, then skill guidance, then the chunk rules.
pub fn build_system_prompt(base: Option<&str>, skills: &[&Skill]) -> String {
    let mut sections = vec![base.unwrap_or(DEFAULT_INSTRUCTIONS).trim().to_string()];
    let guidance = context_for(skills);
    if !guidance.is_empty() {
        sections.push(guidance.trim_end().to_string());
    }
    sections.push(CHUNK_RULES.to_string());
    sections.join("\n\n")
}

/// Instructions placed in the stand-in for a result that was chunked.
pub fn chunk_instructions(task_id: &str, chunk_ids: &[String], total_tokens: usize) -> String {
    let total = chunk_ids.len();
    let mut text = format!(
        "The result was too large and has been split into {total} chunks (about {total_tokens} tokens, task {task_id}).\n\
         Process ALL {total} chunks: call dataproc_get_next_chunk, analyse the chunk, save it with \
         dataproc_save_summary, and repeat until every chunk is done. Then call dataproc_merge_summaries \
         to build the final answer.\nFirst chunk ids:"
    );
    for id in chunk_ids.iter().take(5) {
        text.push_str("\n  - ");
        text.push_str(id);
    }
    if total > 5 {
        text.push_str(&format!("\n  ... and {} more", total - 5));
    }
    text.push_str("\nStart with the first chunk now.");
    text
}
