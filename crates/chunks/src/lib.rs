//! Chunk store and task tracker for toolweave.
//!
//! Oversized inputs are split into content-addressed chunks on disk, grouped
//! into a task, and worked through one chunk at a time: fetch the next
//! unprocessed chunk, save its summary, merge the summaries at the end.
//! Tasks survive restarts, so an interrupted run resumes where it stopped.

pub mod estimate;
pub mod split;
pub mod store;
pub mod tools;

pub use estimate::{CONTEXT_LIMIT_TOKENS, EstimateReport};
pub use split::{ChunkSpan, split_text};
pub use store::{
    Chunk, ChunkStore, ChunkTask, DirectorySplit, Ingested, MergedSummaries, NextChunk, SaveOutcome, Summary,
    TaskStatus, chunk_id,
};
pub use tools::{DataProcPlugin, PREFIX, SERVICE};
