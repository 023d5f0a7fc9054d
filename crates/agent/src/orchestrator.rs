//! The orchestration loop.
//!
//! One call to [`Orchestrator::run`] drives a whole chat: it picks skills,
//! streams the model's answer, executes any tool calls through the plugin
//! registry, diverts oversized results into the chunk store, and repeats
//! until the model answers without calling tools or the round limit is hit.
//! Progress is reported through [`ChatEvent`]s; the run always ends with
//! either `complete` or `error`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use toolweave_chunks::{ChunkStore, SERVICE as CHUNK_SERVICE};
use toolweave_config::{AgentSettings, AppConfig};
use toolweave_core::error::{Error, PluginError, ProviderError};
use toolweave_core::message::{Message, Role, ToolCallRequest};
use toolweave_core::provider::{Provider, ProviderRequest, Usage};
use toolweave_core::token::{estimate_messages_tokens, estimate_tokens, estimate_tools_tokens};
use toolweave_core::tool::ToolSchema;
use toolweave_plugins::PluginRegistry;
use tracing::{debug, info, warn};

use crate::context::ContextManager;
use crate::events::ChatEvent;
use crate::prompt::{build_system_prompt, chunk_instructions};
use crate::redact::{redact, redact_json_text, truncate_display};
use crate::retry::RetryPolicy;
use crate::skills::{Skill, SkillCatalog};
use crate::stats::{StatsTracker, TokenStats};
use crate::stream_parser::{ParsedDelta, TextPiece, TurnParser};

/// Max chars of a tool result shown in `tool_result` events.
const DISPLAY_CHARS: usize = 2_000;

/// Chars kept when an oversized result cannot be chunked.
const TRUNCATE_CHARS: usize = 50_000;

const CEILING_PROMPT: &str = "You have reached the maximum number of tool rounds. Do not call any more tools. \
Summarize what you have found so far and give the best final answer you can.";

const CEILING_FALLBACK: &str = "I reached the tool call limit before finishing this task. \
Please narrow the request or ask me to continue.";

/// Input of one chat run.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    /// Earlier turns of the conversation, oldest first. System messages are
    /// ignored; the run builds its own.
    pub history: Vec<Message>,
    /// Explicit skill selection; `None` selects by prompt.
    pub skills: Option<Vec<String>>,
    /// Restrict the offered tools to these services.
    pub services: Option<Vec<String>>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_skills(mut self, skills: Vec<String>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = Some(services);
        self
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ChatReply {
    /// Reasoning text of every turn
    pub think: String,
    /// The final answer
    pub say: String,
    pub stats: TokenStats,
    /// The full history of the run, system prompt first
    pub messages: Vec<Message>,
}

/// What one streamed provider turn produced.
#[derive(Debug, Default)]
struct Turn {
    think: String,
    say: String,
    calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
}

enum TurnError {
    Provider { error: ProviderError, emitted: bool },
    Cancelled,
}

fn cancelled() -> Error {
    Error::Cancelled("event receiver dropped".into())
}

async fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> Result<(), Error> {
    events.send(event).await.map_err(|_| cancelled())
}

/// Drives provider rounds and tool execution for chats.
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    registry: Arc<PluginRegistry>,
    store: Arc<ChunkStore>,
    skills: SkillCatalog,
    settings: AgentSettings,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    request_timeout: Duration,
    aliases: BTreeMap<String, String>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<PluginRegistry>,
        store: Arc<ChunkStore>,
        model: impl Into<String>,
    ) -> Self {
        let settings = AgentSettings::default();
        Self {
            provider,
            registry,
            store,
            skills: SkillCatalog::default(),
            retry: RetryPolicy::from_settings(&settings),
            settings,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            request_timeout: Duration::from_secs(120),
            aliases: BTreeMap::from([("dataproc".to_string(), CHUNK_SERVICE.to_string())]),
        }
    }

    /// Build from the application config; skills are discovered from the
    /// configured paths.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        registry: Arc<PluginRegistry>,
        store: Arc<ChunkStore>,
    ) -> Self {
        Self::new(provider, registry, store, &config.provider.model)
            .with_settings(config.agent.clone())
            .with_temperature(config.provider.temperature)
            .with_max_tokens(config.provider.max_tokens)
            .with_request_timeout(config.provider.request_timeout())
            .with_aliases(config.plugins.aliases.clone())
            .with_skills(SkillCatalog::discover(&config.skills.paths))
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.retry = RetryPolicy::from_settings(&settings);
        self.settings = settings;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Bound on opening the provider stream and on each chunk read.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Tool-name prefix → service name.
    pub fn with_aliases(mut self, aliases: BTreeMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_skills(mut self, skills: SkillCatalog) -> Self {
        self.skills = skills;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn skills(&self) -> &SkillCatalog {
        &self.skills
    }

    /// Run the chat on a background task and return its event stream.
    pub fn stream_chat(self: &Arc<Self>, request: ChatRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run(request, &tx).await {
                debug!(error = %e, "Streamed chat ended with an error");
            }
        });
        rx
    }

    /// Run one chat to completion, reporting progress on `events`.
    ///
    /// Dropping the receiving half of `events` cancels the run at the next
    /// event; no partially streamed tool call is executed.
    pub async fn run(&self, request: ChatRequest, events: &mpsc::Sender<ChatEvent>) -> Result<ChatReply, Error> {
        let mut stats = StatsTracker::new();
        match self.run_inner(request, events, &mut stats).await {
            Ok(reply) => {
                let _ = events
                    .send(ChatEvent::Complete {
                        think: reply.think.clone(),
                        say: reply.say.clone(),
                        stats: reply.stats,
                    })
                    .await;
                Ok(reply)
            }
            Err(e) => {
                if !matches!(e, Error::Cancelled(_)) {
                    warn!(error = %e, "Chat failed");
                    let _ = events
                        .send(ChatEvent::Error {
                            message: e.to_string(),
                            stats: stats.snapshot(),
                        })
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        request: ChatRequest,
        events: &mpsc::Sender<ChatEvent>,
        stats: &mut StatsTracker,
    ) -> Result<ChatReply, Error> {
        let selected: Vec<&Skill> = match &request.skills {
            Some(names) => self.skills.select_named(names),
            None => self.skills.select(&request.prompt),
        };
        if !selected.is_empty() {
            let names: Vec<&str> = selected.iter().map(|s| s.name.as_str()).collect();
            info!(skills = ?names, "Skills selected");
            emit(
                events,
                ChatEvent::Think {
                    content: format!("Using skills: {}\n", names.join(", ")),
                },
            )
            .await?;
        }

        let tools = self.visible_schemas(&selected, request.services.as_deref()).await;
        debug!(tools = tools.len(), "Tool schemas assembled");

        let system = build_system_prompt(self.settings.system_prompt.as_deref(), &selected);
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(Message::system(system));
        messages.extend(request.history.into_iter().filter(|m| m.role != Role::System));
        messages.push(Message::user(request.prompt));

        let context = ContextManager::new(
            self.settings.history_budget_tokens,
            self.settings.compress_threshold_tokens,
        );
        let mut think = String::new();
        let mut rounds = 0usize;

        let say = loop {
            let outgoing = context.compress(&messages);
            let turn = self.request_turn(outgoing, tools.clone(), events, stats).await?;
            think.push_str(&turn.think);

            if turn.calls.is_empty() {
                messages.push(Message::assistant(&turn.say));
                break turn.say;
            }

            rounds += 1;
            debug!(round = rounds, calls = turn.calls.len(), "Executing tool calls");
            messages.push(Message::assistant_with_calls(&turn.say, turn.calls.clone()));
            for call in &turn.calls {
                let result = self.execute_tool(call, events, stats).await?;
                messages.push(result);
            }

            if rounds >= self.settings.max_iterations {
                break self.summarize_at_ceiling(&context, &mut messages, &mut think, events, stats).await?;
            }
        };

        Ok(ChatReply {
            think,
            say,
            stats: stats.snapshot(),
            messages,
        })
    }

    /// Schemas the model may call for this prompt.
    ///
    /// A service claimed by some skill is offered only while one of its
    /// claiming skills is selected; `only` narrows the result further.
    async fn visible_schemas(&self, selected: &[&Skill], only: Option<&[String]>) -> Vec<ToolSchema> {
        let claimed = self.skills.claimed_services();
        let active: BTreeSet<&str> = selected
            .iter()
            .flat_map(|s| s.services.iter().map(String::as_str))
            .collect();
        let wanted: Option<Vec<String>> = only.map(|names| names.iter().map(|n| self.service_for(n)).collect());

        let visible: Vec<String> = self
            .registry
            .services()
            .await
            .into_iter()
            .filter(|s| !claimed.contains(s.as_str()) || active.contains(s.as_str()))
            .filter(|s| wanted.as_ref().is_none_or(|w| w.contains(s)))
            .collect();
        self.registry.schemas(Some(&visible)).await
    }

    fn service_for(&self, prefix: &str) -> String {
        self.aliases.get(prefix).cloned().unwrap_or_else(|| prefix.to_string())
    }

    /// Map a published tool name to `(service, function)`.
    ///
    /// An exact schema match wins, so services and manifest prefixes may
    /// contain underscores. Otherwise the name is split on the first
    /// underscore and the alias map applied to the service part.
    async fn resolve(&self, tool_name: &str) -> (String, String) {
        if let Some(found) = self.registry.resolve_tool(tool_name).await {
            return found;
        }
        match tool_name.split_once('_') {
            Some((prefix, function)) => (self.service_for(prefix), function.to_string()),
            None => (self.service_for(tool_name), String::new()),
        }
    }

    async fn request_turn(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        events: &mpsc::Sender<ChatEvent>,
        stats: &mut StatsTracker,
    ) -> Result<Turn, Error> {
        let estimated_prompt = estimate_messages_tokens(&messages) + estimate_tools_tokens(&tools);
        let request = ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools,
            stream: true,
        };

        let mut attempt = 0u32;
        loop {
            match self.stream_turn(request.clone(), events).await {
                Ok(turn) => {
                    let completion = estimate_tokens(&turn.think)
                        + estimate_tokens(&turn.say)
                        + turn
                            .calls
                            .iter()
                            .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
                            .sum::<usize>();
                    stats.record_call(estimated_prompt, completion, turn.usage);
                    return Ok(turn);
                }
                Err(TurnError::Cancelled) => return Err(cancelled()),
                Err(TurnError::Provider { error, emitted }) => {
                    // Text already shown to the caller cannot be taken back.
                    let delay = if emitted { None } else { self.retry.delay_for(&error, attempt) };
                    let Some(delay) = delay else {
                        return Err(error.into());
                    };
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Provider call failed, retrying"
                    );
                    emit(
                        events,
                        ChatEvent::ProcessInfo {
                            message: format!(
                                "{error}; retrying in {:.1}s (attempt {attempt}/{})",
                                delay.as_secs_f64(),
                                self.retry.max_retries
                            ),
                        },
                    )
                    .await?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn stream_turn(&self, request: ProviderRequest, events: &mpsc::Sender<ChatEvent>) -> Result<Turn, TurnError> {
        let timeout_secs = self.request_timeout.as_secs();
        let mut rx = tokio::time::timeout(self.request_timeout, self.provider.stream(request))
            .await
            .map_err(|_| TurnError::Provider {
                error: ProviderError::Timeout(format!("no response within {timeout_secs}s")),
                emitted: false,
            })?
            .map_err(|error| TurnError::Provider { error, emitted: false })?;

        let mut parser = TurnParser::new();
        let mut turn = Turn::default();
        let mut emitted = false;

        loop {
            let next = tokio::time::timeout(self.request_timeout, rx.recv())
                .await
                .map_err(|_| TurnError::Provider {
                    error: ProviderError::Timeout(format!("stream stalled for {timeout_secs}s")),
                    emitted,
                })?;
            let Some(item) = next else {
                // Fragments are only complete once the stream says so; a
                // truncated call must never reach the history.
                if !parser.is_done() && parser.has_pending_calls() {
                    return Err(TurnError::Provider {
                        error: ProviderError::StreamInterrupted("stream closed inside a tool call".into()),
                        emitted,
                    });
                }
                if !parser.is_done() && !emitted {
                    return Err(TurnError::Provider {
                        error: ProviderError::StreamInterrupted("stream closed before any output".into()),
                        emitted,
                    });
                }
                break;
            };
            let chunk = item.map_err(|error| TurnError::Provider { error, emitted })?;
            let done = chunk.done;
            for delta in parser.push(chunk) {
                emitted |= self.forward(delta, &mut turn, events).await?;
            }
            if done {
                break;
            }
        }

        for delta in parser.finish() {
            self.forward(delta, &mut turn, events).await?;
        }
        if !turn.say.is_empty() {
            events
                .send(ChatEvent::Say {
                    content: turn.say.clone(),
                    partial: false,
                })
                .await
                .map_err(|_| TurnError::Cancelled)?;
        }
        turn.usage = parser.usage();
        Ok(turn)
    }

    /// Route one parsed delta. Returns whether an event reached the caller.
    async fn forward(
        &self,
        delta: ParsedDelta,
        turn: &mut Turn,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<bool, TurnError> {
        let event = match delta {
            ParsedDelta::Text(TextPiece::Think(text)) => {
                turn.think.push_str(&text);
                ChatEvent::Think { content: text }
            }
            ParsedDelta::Text(TextPiece::Say(text)) => {
                turn.say.push_str(&text);
                ChatEvent::Say {
                    content: text,
                    partial: true,
                }
            }
            ParsedDelta::ToolCall(call) => {
                turn.calls.push(call);
                return Ok(false);
            }
        };
        events.send(event).await.map_err(|_| TurnError::Cancelled)?;
        Ok(true)
    }

    /// Run one tool call and build the tool message answering it.
    async fn execute_tool(
        &self,
        call: &ToolCallRequest,
        events: &mpsc::Sender<ChatEvent>,
        stats: &mut StatsTracker,
    ) -> Result<Message, Error> {
        let (service, function) = self.resolve(&call.name).await;
        let parsed: Result<Value, PluginError> =
            serde_json::from_str(&call.arguments).map_err(|e| PluginError::InvalidArguments {
                tool: call.name.clone(),
                reason: e.to_string(),
            });

        emit(
            events,
            ChatEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: match &parsed {
                    Ok(args) => redact(args),
                    Err(_) => Value::String(redact_json_text(&call.arguments)),
                },
            },
        )
        .await?;
        stats.record_tool_call();

        info!(tool = %call.name, service = %service, "Calling tool");
        let outcome = match parsed {
            Ok(args) => self.registry.call(&service, &function, args).await,
            Err(e) => Err(e),
        };

        let (mut content, success) = match outcome {
            Ok(Value::String(text)) => (text, true),
            Ok(value) => (value.to_string(), true),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool call failed");
                (error_payload(&e).to_string(), false)
            }
        };

        let tokens = estimate_tokens(&content);
        if tokens > self.settings.chunk_threshold_tokens && service != CHUNK_SERVICE {
            content = self.divert_to_chunks(call, content, tokens, events).await?;
        }

        emit(
            events,
            ChatEvent::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                result: truncate_display(&redact_json_text(&content), DISPLAY_CHARS),
                success,
            },
        )
        .await?;

        Ok(Message::tool_result(&call.id, content))
    }

    /// Store an oversized result as a chunk task and return the placeholder
    /// the model sees instead. Falls back to truncation if storing fails.
    async fn divert_to_chunks(
        &self,
        call: &ToolCallRequest,
        content: String,
        tokens: usize,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<String, Error> {
        emit(
            events,
            ChatEvent::ProcessInfo {
                message: format!("Result of {} is too large ({tokens} tokens), splitting into chunks", call.name),
            },
        )
        .await?;

        let description = format!("Processing the result of {}", call.name);
        match self.store.ingest(&content, &call.name, &description).await {
            Ok(ingested) => {
                let chunk_ids: Vec<String> = ingested.chunks.iter().map(|c| c.id.clone()).collect();
                info!(
                    tool = %call.name,
                    task_id = %ingested.task_id,
                    chunks = chunk_ids.len(),
                    "Oversized tool result chunked"
                );
                let instructions = chunk_instructions(&ingested.task_id, &chunk_ids, ingested.total_tokens());
                Ok(json!({
                    "success": true,
                    "chunked": true,
                    "task_id": ingested.task_id,
                    "total_chunks": chunk_ids.len(),
                    "chunk_ids": chunk_ids,
                    "instructions": instructions,
                })
                .to_string())
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Chunking failed, truncating result");
                let kept: String = content.chars().take(TRUNCATE_CHARS).collect();
                Ok(json!({
                    "success": false,
                    "chunked": false,
                    "truncated": true,
                    "error": e.to_string(),
                    "data": format!("{kept}\n\n... [truncated, original length {} chars]", content.chars().count()),
                })
                .to_string())
            }
        }
    }

    async fn summarize_at_ceiling(
        &self,
        context: &ContextManager,
        messages: &mut Vec<Message>,
        think: &mut String,
        events: &mpsc::Sender<ChatEvent>,
        stats: &mut StatsTracker,
    ) -> Result<String, Error> {
        let limit = self.settings.max_iterations;
        warn!(limit, "Tool round limit reached, requesting a summary");
        emit(
            events,
            ChatEvent::ProcessInfo {
                message: format!("Reached the limit of {limit} tool rounds, asking for a summary"),
            },
        )
        .await?;

        messages.push(Message::user(CEILING_PROMPT));
        let outgoing = context.compress(messages);
        let say = match self.request_turn(outgoing, Vec::new(), events, stats).await {
            Ok(turn) => {
                think.push_str(&turn.think);
                turn.say
            }
            Err(Error::Cancelled(reason)) => return Err(Error::Cancelled(reason)),
            Err(e) => {
                warn!(error = %e, "Summary request failed, using fallback answer");
                CEILING_FALLBACK.to_string()
            }
        };
        messages.push(Message::assistant(&say));
        Ok(say)
    }
}

/// Tool error as seen by the model.
fn error_payload(error: &PluginError) -> Value {
    match error {
        PluginError::MissingArguments { names, .. } => json!({
            "error": error.to_string(),
            "missing": names,
        }),
        _ => json!({ "error": error.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use std::path::PathBuf;
    use toolweave_core::message::tool_links_are_valid;
    use toolweave_core::provider::StreamChunk;

    struct Harness {
        provider: Arc<SequentialMockProvider>,
        registry: Arc<PluginRegistry>,
        store: Arc<ChunkStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(steps: Vec<Step>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(PluginRegistry::new(dir.path().join("plugins")));
        registry.register_builtin("kit", arc(KitPlugin)).await.unwrap();
        let store = Arc::new(ChunkStore::new(dir.path().join("cache"), 1_000));
        Harness {
            provider: Arc::new(SequentialMockProvider::new(steps)),
            registry,
            store,
            _dir: dir,
        }
    }

    impl Harness {
        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(
                self.provider.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                "mock-model",
            )
        }
    }

    async fn run_collect(orch: &Orchestrator, request: ChatRequest) -> (Result<ChatReply, Error>, Vec<ChatEvent>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let result = orch.run(request, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        (result, events)
    }

    fn tool_messages(messages: &[Message]) -> Vec<&Message> {
        messages.iter().filter(|m| m.role == Role::Tool).collect()
    }

    #[tokio::test]
    async fn plain_answer_completes() {
        let h = harness(vec![text_step("Hello there")]).await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("hi")).await;
        let reply = result.unwrap();

        assert_eq!(reply.say, "Hello there");
        assert_eq!(reply.stats.api_calls, 1);
        assert_eq!(reply.stats.total_tokens, 15);
        assert_eq!(reply.messages.len(), 3);
        assert_eq!(reply.messages[0].role, Role::System);
        assert!(matches!(events.last(), Some(ChatEvent::Complete { say, .. }) if say == "Hello there"));
        assert!(events.contains(&ChatEvent::Say {
            content: "Hello there".into(),
            partial: false
        }));

        let sent = &h.provider.requests()[0];
        assert!(sent.stream);
        assert_eq!(sent.tool_choice.as_deref(), Some("auto"));
        assert_eq!(sent.tools.len(), 3);
    }

    #[tokio::test]
    async fn think_and_say_are_separated() {
        let h = harness(vec![Step::Stream(vec![
            Ok(StreamChunk::text("<thi")),
            Ok(StreamChunk::text("nk>pondering</think>Answer")),
            Ok(StreamChunk::finished()),
        ])])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("q")).await;
        let reply = result.unwrap();
        assert_eq!(reply.think, "pondering");
        assert_eq!(reply.say, "Answer");
        assert!(events.contains(&ChatEvent::Think {
            content: "pondering".into()
        }));
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_echo", json!({"text": "ping"}))]),
            text_step("It said ping"),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("echo ping")).await;
        let reply = result.unwrap();

        assert_eq!(reply.say, "It said ping");
        assert_eq!(reply.stats.tool_calls, 1);
        assert_eq!(reply.stats.api_calls, 2);
        assert!(tool_links_are_valid(&reply.messages));
        let tools = tool_messages(&reply.messages);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].content, r#"{"echo":"ping"}"#);

        let kinds: Vec<&str> = events.iter().map(ChatEvent::event_type).collect();
        let call = kinds.iter().position(|k| *k == "tool_call").unwrap();
        let result = kinds.iter().position(|k| *k == "tool_result").unwrap();
        assert!(call < result);

        // The second request carries the assistant call and its result.
        let second = &h.provider.requests()[1];
        assert!(second.messages.iter().any(|m| m.tool_call_id.as_deref() == Some("c1")));
    }

    #[tokio::test]
    async fn underscored_service_names_are_callable() {
        let h = harness(vec![
            tool_step(&[("c1", "file_manager_ping", json!({}))]),
            text_step("pong received"),
        ])
        .await;
        h.registry
            .register_builtin("file_manager", arc(NamedPlugin("file_manager")))
            .await
            .unwrap();
        let (result, _) = run_collect(&h.orchestrator(), ChatRequest::new("ping")).await;
        let reply = result.unwrap();

        let tools = tool_messages(&reply.messages);
        assert_eq!(tools.len(), 1);
        assert!(tools[0].content.contains("pong"), "{}", tools[0].content);
        assert!(!tools[0].content.contains("not found"));
    }

    #[tokio::test]
    async fn missing_arguments_are_reported_and_loop_continues() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_need", json!({"host": "db1"}))]),
            text_step("I need the command"),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("run it")).await;
        let reply = result.unwrap();

        let payload: Value = serde_json::from_str(&tool_messages(&reply.messages)[0].content).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("command"));
        assert_eq!(payload["missing"], json!(["command"]));
        assert!(events.iter().any(|e| matches!(e, ChatEvent::ToolResult { success: false, .. })));
        assert_eq!(reply.say, "I need the command");
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_json_become_tool_errors() {
        let h = harness(vec![
            Step::Stream(vec![
                Ok(StreamChunk::tool_fragment(toolweave_core::provider::ToolCallDelta {
                    index: 0,
                    id: Some("c1".into()),
                    name: Some("ghost_run".into()),
                    arguments: Some("{}".into()),
                })),
                Ok(StreamChunk::tool_fragment(toolweave_core::provider::ToolCallDelta {
                    index: 1,
                    id: Some("c2".into()),
                    name: Some("kit_echo".into()),
                    arguments: Some("{not json".into()),
                })),
                Ok(StreamChunk::finished()),
            ]),
            text_step("ok"),
        ])
        .await;
        let (result, _) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        let reply = result.unwrap();
        let tools = tool_messages(&reply.messages);
        assert_eq!(tools.len(), 2);
        assert!(tools[0].content.contains("Plugin not found: ghost"));
        assert!(tools[1].content.contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn oversized_results_are_chunked() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_big", json!({"size": 5_000}))]),
            text_step("processed"),
        ])
        .await;
        let settings = AgentSettings {
            chunk_threshold_tokens: 1_000,
            ..Default::default()
        };
        let orch = h.orchestrator().with_settings(settings);
        let (result, events) = run_collect(&orch, ChatRequest::new("big")).await;
        let reply = result.unwrap();

        let placeholder: Value = serde_json::from_str(&tool_messages(&reply.messages)[0].content).unwrap();
        assert_eq!(placeholder["chunked"], true);
        assert_eq!(placeholder["total_chunks"], 5);
        let task_id = placeholder["task_id"].as_str().unwrap();
        let task = h.store.task(task_id).await.unwrap();
        assert_eq!(task.chunk_ids.len(), 5);
        assert_eq!(task.source, "kit_big");
        assert!(events.iter().any(|e| matches!(e, ChatEvent::ProcessInfo { .. })));
    }

    #[tokio::test]
    async fn results_under_threshold_skip_the_store() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_big", json!({"size": 2_000}))]),
            text_step("fine"),
        ])
        .await;
        let settings = AgentSettings {
            chunk_threshold_tokens: 1_000,
            ..Default::default()
        };
        let (result, _) = run_collect(&h.orchestrator().with_settings(settings), ChatRequest::new("x")).await;
        let reply = result.unwrap();
        assert_eq!(tool_messages(&reply.messages)[0].content.len(), 2_000);
        assert!(h.store.current_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_store_results_are_never_rechunked() {
        let h = harness(vec![
            tool_step(&[("c1", "dataproc_estimate_tokens", json!({"text": "x".repeat(4_000)}))]),
            text_step("done"),
        ])
        .await;
        h.registry
            .register_builtin(CHUNK_SERVICE, Arc::new(toolweave_chunks::DataProcPlugin::new(Arc::clone(&h.store))))
            .await
            .unwrap();
        let settings = AgentSettings {
            chunk_threshold_tokens: 1,
            ..Default::default()
        };
        let (result, _) = run_collect(&h.orchestrator().with_settings(settings), ChatRequest::new("x")).await;
        let reply = result.unwrap();
        let payload: Value = serde_json::from_str(&tool_messages(&reply.messages)[0].content).unwrap();
        assert!(payload.get("chunked").is_none());
        assert!(h.store.current_task().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let h = harness(vec![
            Step::Fail(ProviderError::Network("reset".into())),
            Step::Fail(ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into(),
            }),
            Step::Fail(ProviderError::Timeout("slow".into())),
            text_step("finally"),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        assert_eq!(result.unwrap().say, "finally");
        assert_eq!(h.provider.call_count(), 4);

        let notices: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::ProcessInfo { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 3);
        assert!(notices[0].contains("2.0s"));
        assert!(notices[1].contains("4.0s"));
        assert!(notices[2].contains("8.0s"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_exhausted() {
        let h = harness(vec![
            Step::Fail(ProviderError::Network("a".into())),
            Step::Fail(ProviderError::Network("b".into())),
            Step::Fail(ProviderError::Network("c".into())),
            Step::Fail(ProviderError::Network("d".into())),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        assert!(matches!(result, Err(Error::Provider(ProviderError::Network(_)))));
        assert_eq!(h.provider.call_count(), 4);
        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let h = harness(vec![Step::Fail(ProviderError::AuthenticationFailed("bad key".into()))]).await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        assert!(result.is_err());
        assert_eq!(h.provider.call_count(), 1);
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::ProcessInfo { .. })));
        match events.last() {
            Some(ChatEvent::Error { message, stats }) => {
                assert!(message.contains("bad key"));
                assert_eq!(stats.api_calls, 0);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interruption_after_output_is_not_retried() {
        let h = harness(vec![Step::Stream(vec![
            Ok(StreamChunk::text("partial answer")),
            Err(ProviderError::StreamInterrupted("connection reset".into())),
        ])])
        .await;
        let (result, _) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        assert!(matches!(result, Err(Error::Provider(ProviderError::StreamInterrupted(_)))));
        assert_eq!(h.provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_tool_call_is_retried_not_executed() {
        let h = harness(vec![
            Step::Stream(vec![Ok(StreamChunk::tool_fragment(toolweave_core::provider::ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("kit_echo".into()),
                arguments: Some(r#"{"text": "pi"#.into()),
            }))]),
            tool_step(&[("c1", "kit_echo", json!({"text": "ping"}))]),
            text_step("It said ping"),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("echo ping")).await;
        let reply = result.unwrap();

        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(reply.stats.tool_calls, 1);
        let calls: Vec<&ToolCallRequest> = reply.messages.iter().flat_map(|m| m.tool_calls.iter()).collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, r#"{"text":"ping"}"#);
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::ProcessInfo { message } if message.contains("inside a tool call")
        )));
    }

    #[tokio::test]
    async fn truncated_tool_call_after_text_fails_the_run() {
        let h = harness(vec![Step::Stream(vec![
            Ok(StreamChunk::text("Let me check.")),
            Ok(StreamChunk::tool_fragment(toolweave_core::provider::ToolCallDelta {
                index: 0,
                id: Some("c1".into()),
                name: Some("kit_echo".into()),
                arguments: Some(r#"{"text": "pi"#.into()),
            })),
        ])])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("echo ping")).await;
        assert!(matches!(result, Err(Error::Provider(ProviderError::StreamInterrupted(_)))));
        assert_eq!(h.provider.call_count(), 1);
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::ToolCall { .. })));
        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
    }

    #[tokio::test]
    async fn iteration_ceiling_requests_a_summary() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_echo", json!({"text": "a"}))]),
            tool_step(&[("c2", "kit_echo", json!({"text": "b"}))]),
            text_step("summary of a and b"),
        ])
        .await;
        let settings = AgentSettings {
            max_iterations: 2,
            ..Default::default()
        };
        let (result, _) = run_collect(&h.orchestrator().with_settings(settings), ChatRequest::new("loop")).await;
        let reply = result.unwrap();
        assert_eq!(reply.say, "summary of a and b");

        let last = h.provider.requests().pop().unwrap();
        assert!(last.tools.is_empty());
        assert!(last.tool_choice.is_none());
        assert_eq!(last.messages.last().unwrap().content, CEILING_PROMPT);
    }

    #[tokio::test]
    async fn failed_summary_falls_back() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_echo", json!({"text": "a"}))]),
            Step::Fail(ProviderError::ContextLengthExceeded("too long".into())),
        ])
        .await;
        let settings = AgentSettings {
            max_iterations: 1,
            ..Default::default()
        };
        let (result, events) = run_collect(&h.orchestrator().with_settings(settings), ChatRequest::new("x")).await;
        assert_eq!(result.unwrap().say, CEILING_FALLBACK);
        assert!(matches!(events.last(), Some(ChatEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_before_tools_run() {
        let h = harness(vec![tool_step(&[("c1", "kit_echo", json!({"text": "a"}))])]).await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = h.orchestrator().run(ChatRequest::new("x"), &tx).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    fn gated_skills() -> SkillCatalog {
        SkillCatalog::new(vec![Skill::parse(
            "ops",
            "---\nname: ops\ntriggers: [server]\nservices: [ssh]\n---\nUse ssh carefully.",
            PathBuf::from("ops"),
        )])
    }

    #[tokio::test]
    async fn skill_selection_changes_tools_between_prompts() {
        let h = harness(vec![text_step("one"), text_step("two")]).await;
        h.registry.register_builtin("ssh", arc(NamedPlugin("ssh"))).await.unwrap();
        let orch = h.orchestrator().with_skills(gated_skills());

        let (first, events) = run_collect(&orch, ChatRequest::new("what is the weather")).await;
        let first = first.unwrap();
        assert!(!events.iter().any(|e| matches!(e, ChatEvent::Think { .. })));

        let (second, events) = run_collect(
            &orch,
            ChatRequest::new("restart the server").with_history(first.messages.clone()),
        )
        .await;
        second.unwrap();
        assert!(matches!(&events[0], ChatEvent::Think { content } if content.contains("ops")));

        let requests = h.provider.requests();
        let names = |r: &ProviderRequest| -> Vec<String> { r.tools.iter().map(|t| t.name.clone()).collect() };
        assert!(!names(&requests[0]).contains(&"ssh_ping".to_string()));
        assert!(names(&requests[1]).contains(&"ssh_ping".to_string()));
        assert!(requests[1].messages[0].content.contains("Use ssh carefully."));
        assert_eq!(requests[1].messages.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[tokio::test]
    async fn explicit_skills_and_service_filter() {
        let h = harness(vec![text_step("a"), text_step("b")]).await;
        h.registry.register_builtin("ssh", arc(NamedPlugin("ssh"))).await.unwrap();
        h.registry.register_builtin("web", arc(NamedPlugin("web"))).await.unwrap();
        let orch = h.orchestrator().with_skills(gated_skills());

        run_collect(&orch, ChatRequest::new("no trigger here").with_skills(vec!["ops".into()]))
            .await
            .0
            .unwrap();
        run_collect(&orch, ChatRequest::new("anything").with_services(vec!["web".into()]))
            .await
            .0
            .unwrap();

        let requests = h.provider.requests();
        let first: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert!(first.contains(&"ssh_ping"));
        let second: Vec<&str> = requests[1].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(second, vec!["web_ping"]);
    }

    #[tokio::test]
    async fn tool_events_are_redacted_but_history_is_not() {
        let h = harness(vec![
            tool_step(&[("c1", "kit_echo", json!({"text": "hi", "api_key": "sk-live"}))]),
            text_step("ok"),
        ])
        .await;
        let (result, events) = run_collect(&h.orchestrator(), ChatRequest::new("x")).await;
        let reply = result.unwrap();

        let args = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::ToolCall { arguments, .. } => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(args["api_key"], crate::redact::REDACTED);
        assert_eq!(args["text"], "hi");

        let assistant = reply.messages.iter().find(|m| !m.tool_calls.is_empty()).unwrap();
        assert!(assistant.tool_calls[0].arguments.contains("sk-live"));
    }

    #[tokio::test]
    async fn stream_chat_delivers_terminal_event() {
        let h = harness(vec![text_step("streamed")]).await;
        let orch = Arc::new(h.orchestrator());
        let mut rx = orch.stream_chat(ChatRequest::new("x"));
        let mut last = None;
        while let Some(e) = rx.recv().await {
            last = Some(e);
        }
        assert!(matches!(last, Some(ChatEvent::Complete { say, .. }) if say == "streamed"));
    }
}
