//! End-to-end integration tests for toolweave.
//!
//! These tests drive the orchestrator against a scripted streaming provider
//! with real plugin files on disk, the real chunk store, and the background
//! hot-reload poller.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use toolweave_agent::{ChatEvent, ChatRequest, Orchestrator};
use toolweave_chunks::{ChunkStore, DataProcPlugin, SERVICE as CHUNK_SERVICE, chunk_id, split_text};
use toolweave_config::{AgentSettings, AppConfig};
use toolweave_core::error::{PluginError, ProviderError};
use toolweave_core::message::{Message, Role};
use toolweave_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage};
use toolweave_core::tool::{Plugin, ToolHandler, ToolSchema, ToolTable};
use toolweave_plugins::{HotReloader, ManifestLoader, PluginRegistry, ReloadEvent};

// ── Scripted Provider ────────────────────────────────────────────────────

/// A streaming provider that replays one scripted turn per request.
struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<StreamChunk>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_request(&self) -> ProviderRequest {
        self.requests.lock().unwrap().last().cloned().expect("no request recorded")
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let turn = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!("ScriptedProvider exhausted after {} calls", self.calls());
        });
        let (tx, rx) = mpsc::channel(turn.len().max(1));
        for chunk in turn {
            tx.try_send(Ok(chunk)).unwrap();
        }
        Ok(rx)
    }
}

fn answer(text: &str) -> Vec<StreamChunk> {
    vec![
        StreamChunk::text(text),
        StreamChunk {
            done: true,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            ..Default::default()
        },
    ]
}

fn calls(list: &[(&str, &str, Value)]) -> Vec<StreamChunk> {
    let mut turn: Vec<StreamChunk> = list
        .iter()
        .enumerate()
        .map(|(index, (id, name, args))| {
            StreamChunk::tool_fragment(ToolCallDelta {
                index: index as u32,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(args.to_string()),
            })
        })
        .collect();
    turn.push(StreamChunk::finished());
    turn
}

// ── Fixtures ─────────────────────────────────────────────────────────────

fn greeter_manifest(template: &str) -> Value {
    json!({
        "description": "Greetings",
        "tools": [{
            "name": "greet",
            "description": "Greets someone",
            "parameters": {
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            },
            "template": template
        }]
    })
}

/// Write through a temporary file so the poller never sees a half-written manifest.
fn write_plugin(dir: &Path, name: &str, body: &Value) {
    let staging = dir.join(format!("{name}.staging"));
    std::fs::write(&staging, body.to_string()).unwrap();
    std::fs::rename(staging, dir.join(format!("{name}.plugin.json"))).unwrap();
}

/// Built-in `logs` plugin whose `fetch` tool returns a large plain-text log.
struct LogsPlugin;

fn log_text() -> String {
    (0..40).map(|i| format!("{i:02} {}\n", "event ".repeat(16))).collect()
}

impl Plugin for LogsPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        Ok(ToolTable::new().with_tool(
            "fetch",
            ToolSchema::new("logs_fetch", "Fetch the service log", json!({"type": "object"})),
            ToolHandler::sync(|_| Ok(Value::String(log_text()))),
        ))
    }
}

async fn run_chat(orchestrator: &Orchestrator, prompt: &str) -> (toolweave_agent::ChatReply, Vec<ChatEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let reply = orchestrator
        .run(ChatRequest::new(prompt), &tx)
        .await
        .expect("chat should succeed");
    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (reply, events)
}

fn tool_message<'a>(messages: &'a [Message], call_id: &str) -> &'a Message {
    messages
        .iter()
        .find(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id))
        .unwrap_or_else(|| panic!("no tool message for {call_id}"))
}

// ── E2E: Manifest Plugins ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_manifest_tool_round_trip() {
    let plugins = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_plugin(plugins.path(), "greeter", &greeter_manifest("Hello, {name}!"));

    let registry = Arc::new(PluginRegistry::new(plugins.path()).with_loader(ManifestLoader));
    let loaded = registry.load_all().await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].tools, vec!["greet".to_string()]);

    let provider = ScriptedProvider::new(vec![
        calls(&[("c1", "greeter_greet", json!({"name": "Ada"}))]),
        answer("I greeted Ada."),
    ]);
    let store = Arc::new(ChunkStore::new(cache.path(), 1_000));
    let orchestrator = Orchestrator::new(provider.clone(), registry, store, "mock");

    let (reply, events) = run_chat(&orchestrator, "say hello to Ada").await;

    assert_eq!(reply.say, "I greeted Ada.");
    assert_eq!(reply.stats.tool_calls, 1);
    assert_eq!(provider.calls(), 2);
    assert!(tool_message(&reply.messages, "c1").content.contains("Hello, Ada!"));

    let offered: Vec<String> = provider.last_request().tools.iter().map(|t| t.name.clone()).collect();
    assert_eq!(offered, vec!["greeter_greet".to_string()]);

    assert!(events.iter().any(|e| matches!(
        e,
        ChatEvent::ToolResult { name, success: true, .. } if name == "greeter_greet"
    )));
    assert!(matches!(events.last(), Some(ChatEvent::Complete { .. })));
}

#[tokio::test]
async fn e2e_missing_arguments_reach_the_model() {
    let plugins = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_plugin(plugins.path(), "greeter", &greeter_manifest("Hello, {name}!"));

    let registry = Arc::new(PluginRegistry::new(plugins.path()).with_loader(ManifestLoader));
    registry.load_all().await;

    let provider = ScriptedProvider::new(vec![
        calls(&[("c1", "greeter_greet", json!({}))]),
        answer("Who should I greet?"),
    ]);
    let store = Arc::new(ChunkStore::new(cache.path(), 1_000));
    let orchestrator = Orchestrator::new(provider.clone(), registry, store, "mock");

    let (reply, events) = run_chat(&orchestrator, "greet someone").await;

    let payload: Value = serde_json::from_str(&tool_message(&reply.messages, "c1").content).unwrap();
    assert!(payload["error"].as_str().unwrap().contains("name"));
    assert_eq!(payload["missing"], json!(["name"]));
    assert!(events.iter().any(|e| matches!(e, ChatEvent::ToolResult { success: false, .. })));
    assert_eq!(reply.say, "Who should I greet?");
}

// ── E2E: Chunked Map-Reduce ──────────────────────────────────────────────

#[tokio::test]
async fn e2e_oversized_result_is_processed_chunk_by_chunk() {
    let plugins = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let store = Arc::new(ChunkStore::new(cache.path(), 1_000));

    let registry = Arc::new(PluginRegistry::new(plugins.path()));
    registry.register_builtin("logs", Arc::new(LogsPlugin)).await.unwrap();
    registry
        .register_builtin(CHUNK_SERVICE, Arc::new(DataProcPlugin::new(Arc::clone(&store))))
        .await
        .unwrap();

    // The ids the store will assign, so the script can save a summary for each.
    let expected: Vec<String> = split_text(&log_text(), 1_000)
        .iter()
        .enumerate()
        .map(|(index, span)| chunk_id("logs_fetch", index, &span.text))
        .collect();
    assert!(expected.len() > 1);

    let saves: Vec<(String, Value)> = expected
        .iter()
        .enumerate()
        .map(|(i, id)| {
            (
                format!("s{i}"),
                json!({"chunk_id": id, "summary": format!("summary #{i};"), "key_points": [format!("point {i}")]}),
            )
        })
        .collect();
    let save_calls: Vec<(&str, &str, Value)> = saves
        .iter()
        .map(|(id, args)| (id.as_str(), "dataproc_save_summary", args.clone()))
        .collect();

    let provider = ScriptedProvider::new(vec![
        calls(&[("c1", "logs_fetch", json!({}))]),
        calls(&[("c2", "dataproc_get_next_chunk", json!({}))]),
        calls(&save_calls),
        calls(&[("c3", "dataproc_merge_summaries", json!({}))]),
        answer("All 40 entries are routine events."),
    ]);

    let settings = AgentSettings {
        chunk_threshold_tokens: 100,
        ..AgentSettings::default()
    };
    let orchestrator =
        Orchestrator::new(provider.clone(), registry, Arc::clone(&store), "mock").with_settings(settings);

    let (reply, events) = run_chat(&orchestrator, "summarize the log").await;

    // The model saw a placeholder, never the raw log.
    let placeholder: Value = serde_json::from_str(&tool_message(&reply.messages, "c1").content).unwrap();
    assert_eq!(placeholder["chunked"], true);
    assert_eq!(placeholder["total_chunks"], expected.len());
    assert_eq!(placeholder["chunk_ids"], json!(expected));
    let task_id = placeholder["task_id"].as_str().unwrap().to_string();
    assert!(events.iter().any(|e| matches!(
        e,
        ChatEvent::ProcessInfo { message } if message.contains("splitting into chunks")
    )));

    let next: Value = serde_json::from_str(&tool_message(&reply.messages, "c2").content).unwrap();
    assert_eq!(next["chunk_id"], expected[0].as_str());
    assert_eq!(next["position"], 1);

    let status = store.status(Some(&task_id)).await.unwrap();
    assert!(status.done);
    assert_eq!(status.processed, expected.len());
    assert_eq!(status.percent, 100.0);

    let task = store.task(&task_id).await.unwrap();
    assert_eq!(task.source, "logs_fetch");

    let merged = tool_message(&reply.messages, "c3").content.clone();
    for i in 0..expected.len() {
        assert_eq!(merged.matches(&format!("summary #{i};")).count(), 1, "summary {i}");
    }
    let merged: Value = serde_json::from_str(&merged).unwrap();
    assert_eq!(merged["total_summaries"], expected.len());
    assert_eq!(merged["missing"], json!([]));

    assert_eq!(reply.say, "All 40 entries are routine events.");
    assert_eq!(reply.stats.tool_calls as usize, 3 + expected.len());
    assert_eq!(provider.calls(), 5);
}

// ── E2E: Hot Reload ──────────────────────────────────────────────────────

async fn wait_for(events: &mut tokio::sync::broadcast::Receiver<ReloadEvent>, want: impl Fn(&ReloadEvent) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("reload channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a reload event");
}

#[tokio::test]
async fn e2e_hot_reload_serves_new_and_edited_plugins() {
    let plugins = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let registry = Arc::new(PluginRegistry::new(plugins.path()).with_loader(ManifestLoader));
    assert!(registry.load_all().await.is_empty());
    let mut reload_events = registry.subscribe();

    let reloader = HotReloader::new(Arc::clone(&registry), Duration::from_millis(50));
    assert!(reloader.start().await);
    assert!(!reloader.start().await);

    write_plugin(plugins.path(), "greeter", &greeter_manifest("Hello, {name}!"));
    wait_for(&mut reload_events, |e| {
        matches!(e, ReloadEvent::Loaded { name, .. } if name == "greeter")
    })
    .await;

    let provider = ScriptedProvider::new(vec![
        calls(&[("c1", "greeter_greet", json!({"name": "Lin"}))]),
        answer("done"),
        calls(&[("c2", "greeter_greet", json!({"name": "Lin"}))]),
        answer("done again"),
    ]);
    let store = Arc::new(ChunkStore::new(cache.path(), 1_000));
    let orchestrator = Orchestrator::new(provider.clone(), Arc::clone(&registry), store, "mock");

    let (reply, _) = run_chat(&orchestrator, "greet Lin").await;
    assert!(tool_message(&reply.messages, "c1").content.contains("Hello, Lin!"));

    let path = plugins.path().join("greeter.plugin.json");
    write_plugin(plugins.path(), "greeter", &greeter_manifest("Welcome back, {name}."));
    // Push the mtime forward so coarse filesystem clocks register the edit.
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();
    drop(file);

    wait_for(&mut reload_events, |e| {
        matches!(e, ReloadEvent::Reloaded { name, .. } if name == "greeter")
    })
    .await;

    let (reply, _) = run_chat(&orchestrator, "greet Lin again").await;
    assert!(tool_message(&reply.messages, "c2").content.contains("Welcome back, Lin."));

    assert!(reloader.stop().await);
    assert!(!reloader.stop().await);
}

// ── E2E: Configuration System ────────────────────────────────────────────

#[tokio::test]
async fn e2e_config_defaults_and_validation() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.agent.max_iterations, 20);
    assert_eq!(config.chunks.max_chars_per_chunk, 62_500);
    assert_eq!(config.plugins.aliases.get("dataproc").map(String::as_str), Some("data_processor"));

    let parsed: AppConfig = toml::from_str(&AppConfig::default_toml()).unwrap();
    assert_eq!(parsed.agent.chunk_threshold_tokens, config.agent.chunk_threshold_tokens);

    let mut bad = AppConfig::default();
    bad.agent.max_iterations = 0;
    assert!(bad.validate().is_err());

    let mut bad = AppConfig::default();
    bad.plugins.poll_interval_ms = 0;
    assert!(bad.validate().is_err());
}

#[tokio::test]
async fn e2e_orchestrator_from_config_uses_configured_limits() {
    let plugins = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let skills = tempfile::tempdir().unwrap();
    std::fs::create_dir(skills.path().join("greeting")).unwrap();
    std::fs::write(
        skills.path().join("greeting").join("SKILL.md"),
        "---\nname: greeting\ndescription: Greet people warmly\ntriggers: [hello, greet]\n---\nAlways greet by name.",
    )
    .unwrap();

    let mut config = AppConfig::default();
    config.plugins.dir = plugins.path().to_path_buf();
    config.chunks.cache_dir = cache.path().to_path_buf();
    config.skills.paths = vec![skills.path().to_path_buf()];
    config.agent.max_iterations = 1;

    let registry = Arc::new(toolweave_plugins::registry_from_config(&config.plugins, Duration::from_secs(5)));
    write_plugin(plugins.path(), "greeter", &greeter_manifest("Hello, {name}!"));
    registry.load_all().await;
    let store = Arc::new(ChunkStore::from_config(&config.chunks));

    // One tool round is allowed, then the run is asked for a summary.
    let provider = ScriptedProvider::new(vec![
        calls(&[("c1", "greeter_greet", json!({"name": "Bo"}))]),
        answer("Greeted Bo."),
    ]);
    let orchestrator = Orchestrator::from_config(&config, provider.clone(), registry, store);
    assert_eq!(orchestrator.skills().len(), 1);

    let (reply, _) = run_chat(&orchestrator, "please greet Bo").await;
    assert_eq!(reply.say, "Greeted Bo.");
    assert_eq!(provider.calls(), 2);

    let system = &provider.last_request().messages[0];
    assert!(system.content.contains("Always greet by name."));
    assert!(provider.last_request().tools.is_empty());
}
