//! Turns provider stream chunks into typed deltas.
//!
//! Text is routed through a [`ThinkSplitter`] so `<think>…</think>` spans
//! come out as reasoning and everything else as the visible answer. Tool
//! call fragments are collected by index and only released, as complete
//! [`ToolCallRequest`]s, once the stream segment is over.

use std::collections::BTreeMap;

use toolweave_core::message::ToolCallRequest;
use toolweave_core::provider::{StreamChunk, ToolCallDelta, Usage};
use tracing::warn;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// A piece of streamed text, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPiece {
    Think(String),
    Say(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkState {
    Say,
    Think,
}

/// Splits text on `<think>` markers, including markers cut across deltas.
#[derive(Debug)]
pub struct ThinkSplitter {
    state: ThinkState,
    buffer: String,
}

impl Default for ThinkSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self {
            state: ThinkState::Say,
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<TextPiece> {
        self.buffer.push_str(text);
        let mut pieces = Vec::new();

        loop {
            let tag = match self.state {
                ThinkState::Say => THINK_OPEN,
                ThinkState::Think => THINK_CLOSE,
            };

            if let Some(pos) = self.buffer.find(tag) {
                let before: String = self.buffer.drain(..pos).collect();
                self.buffer.drain(..tag.len());
                self.emit(&mut pieces, before);
                self.state = match self.state {
                    ThinkState::Say => ThinkState::Think,
                    ThinkState::Think => ThinkState::Say,
                };
                continue;
            }

            // Hold back a trailing fragment that could still become the tag.
            let keep = partial_tag_len(&self.buffer, tag);
            let ready_len = self.buffer.len() - keep;
            let ready: String = self.buffer.drain(..ready_len).collect();
            self.emit(&mut pieces, ready);
            break;
        }
        pieces
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> Vec<TextPiece> {
        let mut pieces = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        self.emit(&mut pieces, rest);
        pieces
    }

    fn emit(&self, pieces: &mut Vec<TextPiece>, text: String) {
        if text.is_empty() {
            return;
        }
        pieces.push(match self.state {
            ThinkState::Say => TextPiece::Say(text),
            ThinkState::Think => TextPiece::Think(text),
        });
    }
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `tag`.
fn partial_tag_len(buffer: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&n| buffer.ends_with(&tag[..n]))
        .unwrap_or(0)
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates tool call fragments keyed by their stream index.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAssembler {
    pub fn push(&mut self, delta: &ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = delta.name.as_deref().filter(|s| !s.is_empty()) {
            call.name = Some(name.to_string());
        }
        if let Some(args) = &delta.arguments {
            call.arguments.push_str(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Completed calls in index order. Fragments that never received a name
    /// are dropped.
    pub fn finish(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.calls)
            .into_iter()
            .filter_map(|(index, call)| {
                let Some(name) = call.name else {
                    warn!(index, "Dropping tool call fragment without a name");
                    return None;
                };
                let arguments = if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                Some(ToolCallRequest {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name,
                    arguments,
                })
            })
            .collect()
    }
}

/// Output of the [`TurnParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedDelta {
    Text(TextPiece),
    ToolCall(ToolCallRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Text,
    ToolCallFragment,
}

/// State machine over one streamed assistant turn.
#[derive(Debug)]
pub struct TurnParser {
    state: ParserState,
    splitter: ThinkSplitter,
    tools: ToolCallAssembler,
    usage: Option<Usage>,
    done: bool,
}

impl Default for TurnParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Text,
            splitter: ThinkSplitter::new(),
            tools: ToolCallAssembler::default(),
            usage: None,
            done: false,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Whether the provider signalled the end of the turn.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Usage reported by the provider, if any.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Whether tool call fragments are waiting for [`Self::finish`].
    pub fn has_pending_calls(&self) -> bool {
        !self.tools.is_empty()
    }

    /// Feed one chunk. Only text deltas are returned here; tool calls come
    /// out of [`Self::finish`].
    pub fn push(&mut self, chunk: StreamChunk) -> Vec<ParsedDelta> {
        let mut out = Vec::new();
        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
            self.state = ParserState::Text;
            out.extend(self.splitter.push(text).into_iter().map(ParsedDelta::Text));
        }
        if !chunk.tool_call_deltas.is_empty() {
            self.state = ParserState::ToolCallFragment;
            for delta in &chunk.tool_call_deltas {
                self.tools.push(delta);
            }
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.done {
            self.done = true;
        }
        out
    }

    /// End the turn: flush buffered text, then release the assembled calls.
    pub fn finish(&mut self) -> Vec<ParsedDelta> {
        let mut out: Vec<ParsedDelta> = self.splitter.finish().into_iter().map(ParsedDelta::Text).collect();
        out.extend(self.tools.finish().into_iter().map(ParsedDelta::ToolCall));
        self.state = ParserState::Text;
        out
    }
}
