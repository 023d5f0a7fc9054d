//! Shared test helpers for the orchestrator tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use toolweave_core::error::{PluginError, ProviderError};
use toolweave_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage};
use toolweave_core::tool::{Plugin, ToolHandler, ToolSchema, ToolTable};

/// One scripted provider call.
pub enum Step {
    /// The stream opens and yields these items, then closes.
    Stream(Vec<Result<StreamChunk, ProviderError>>),
    /// The request fails before any chunk.
    Fail(ProviderError),
}

/// A mock provider that replays scripted streams in order.
///
/// Each call to `stream` consumes the next step. Panics if more calls are
/// made than steps provided.
pub struct SequentialMockProvider {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .expect("SequentialMockProvider: no more scripted steps");
        match step {
            Step::Fail(e) => Err(e),
            Step::Stream(items) => {
                let (tx, rx) = mpsc::channel(items.len().max(1));
                for item in items {
                    tx.try_send(item).unwrap();
                }
                Ok(rx)
            }
        }
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// A complete text answer, streamed in two deltas.
pub fn text_step(text: &str) -> Step {
    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(text.len(), |(i, _)| i);
    Step::Stream(vec![
        Ok(StreamChunk::text(&text[..mid])),
        Ok(StreamChunk::text(&text[mid..])),
        Ok(StreamChunk {
            done: true,
            usage: Some(usage()),
            ..Default::default()
        }),
    ])
}

/// A turn that calls the given tools, arguments split across two fragments.
pub fn tool_step(calls: &[(&str, &str, Value)]) -> Step {
    let mut items = Vec::new();
    for (index, (id, name, args)) in calls.iter().enumerate() {
        let raw = args.to_string();
        let (head, tail) = raw.split_at(raw.len() / 2);
        items.push(Ok(StreamChunk::tool_fragment(ToolCallDelta {
            index: index as u32,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            arguments: Some(head.to_string()),
        })));
        items.push(Ok(StreamChunk::tool_fragment(ToolCallDelta {
            index: index as u32,
            arguments: Some(tail.to_string()),
            ..Default::default()
        })));
    }
    items.push(Ok(StreamChunk::finished()));
    Step::Stream(items)
}

/// Built-in test plugin `kit`: `echo`, `big` (returns `size` chars) and
/// `need` (requires `host` and `command`).
pub struct KitPlugin;

impl Plugin for KitPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        Ok(ToolTable::new()
            .with_tool(
                "echo",
                ToolSchema::new("kit_echo", "Echo text", json!({"type": "object", "properties": {"text": {"type": "string"}}})),
                ToolHandler::sync(|args| Ok(json!({"echo": args["text"]}))),
            )
            .with_tool(
                "big",
                ToolSchema::new("kit_big", "Large output", json!({"type": "object"})),
                ToolHandler::sync(|args| {
                    let size = args["size"].as_u64().unwrap_or(10) as usize;
                    Ok(Value::String("L".repeat(size)))
                }),
            )
            .with_tool(
                "need",
                ToolSchema::new(
                    "kit_need",
                    "Needs arguments",
                    json!({
                        "type": "object",
                        "properties": {"host": {"type": "string"}, "command": {"type": "string"}},
                        "required": ["host", "command"]
                    }),
                ),
                ToolHandler::sync(|_| Ok(json!("ran"))),
            ))
    }
}

/// A single-tool plugin used to check skill gating.
pub struct NamedPlugin(pub &'static str);

impl Plugin for NamedPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        let name = format!("{}_ping", self.0);
        Ok(ToolTable::new().with_tool(
            "ping",
            ToolSchema::new(name, "Ping", json!({"type": "object"})),
            ToolHandler::sync(|_| Ok(json!("pong"))),
        ))
    }
}

pub fn arc<T: Plugin + 'static>(plugin: T) -> Arc<dyn Plugin> {
    Arc::new(plugin)
}
