//! Plugin capability interface.
//!
//! A plugin exposes a [`ToolTable`]: function name → [`ToolFunction`], each
//! pairing the schema published to the model with the handler that runs it.
//! Handlers are either plain synchronous closures or async invocables; the
//! caller awaits [`ToolFunction::invoke`] in both cases.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginError;

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Globally unique tool name, namespaced as `<service>_<function>`
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// The provider function-calling shape:
    /// `{"type":"function","function":{name, description, parameters}}`.
    pub fn to_function_json(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// Accepts both the wrapped function-calling shape and the flat one.
    pub fn from_json(value: &Value) -> Option<Self> {
        let inner = value.get("function").unwrap_or(value);
        let name = inner.get("name")?.as_str()?.to_string();
        let description = inner
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parameters = inner
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
        Some(Self {
            name,
            description,
            parameters,
        })
    }

    /// Required parameters that have no declared default and are absent
    /// (or null) in `args`.
    pub fn missing_required(&self, args: &Value) -> Vec<String> {
        let Some(required) = self.parameters.get("required").and_then(Value::as_array) else {
            return Vec::new();
        };
        let properties = self.parameters.get("properties");
        required
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| {
                let has_default = properties
                    .and_then(|p| p.get(*name))
                    .is_some_and(|p| p.get("default").is_some());
                let present = args.get(*name).is_some_and(|v| !v.is_null());
                !has_default && !present
            })
            .map(str::to_string)
            .collect()
    }
}

/// An awaited tool implementation.
#[async_trait]
pub trait Invocable: Send + Sync {
    async fn invoke(&self, arguments: Value) -> Result<Value, PluginError>;
}

/// Synchronous tool implementation.
pub type SyncToolFn = dyn Fn(Value) -> Result<Value, PluginError> + Send + Sync;

/// How a tool runs. Synchronous handlers are moved onto the blocking pool
/// so a slow one never stalls the conversation's executor thread.
#[derive(Clone)]
pub enum ToolHandler {
    Sync(Arc<SyncToolFn>),
    Async(Arc<dyn Invocable>),
}

impl ToolHandler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn invocable<I: Invocable + 'static>(inner: I) -> Self {
        Self::Async(Arc::new(inner))
    }

    /// Wraps an async closure.
    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PluginError>> + Send + 'static,
    {
        Self::Async(Arc::new(AsyncFn(f)))
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> Invocable for AsyncFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, PluginError>> + Send,
{
    async fn invoke(&self, arguments: Value) -> Result<Value, PluginError> {
        (self.0)(arguments).await
    }
}

/// A published tool: its schema plus the code behind it.
#[derive(Clone)]
pub struct ToolFunction {
    pub schema: ToolSchema,
    pub handler: ToolHandler,
}

impl ToolFunction {
    pub async fn invoke(&self, arguments: Value) -> Result<Value, PluginError> {
        match &self.handler {
            ToolHandler::Async(inner) => inner.invoke(arguments).await,
            ToolHandler::Sync(f) => {
                let f = Arc::clone(f);
                tokio::task::spawn_blocking(move || f(arguments)).await.map_err(|e| {
                    tracing::error!(tool = %self.schema.name, error = %e, "Tool handler panicked");
                    PluginError::invocation(&self.schema.name, e)
                })?
            }
        }
    }
}

impl std::fmt::Debug for ToolFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.handler {
            ToolHandler::Sync(_) => "sync",
            ToolHandler::Async(_) => "async",
        };
        f.debug_struct("ToolFunction")
            .field("schema", &self.schema.name)
            .field("handler", &kind)
            .finish()
    }
}

/// Everything a plugin publishes, keyed by function name (the part of the
/// tool name after the service prefix).
#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    functions: BTreeMap<String, Arc<ToolFunction>>,
}

impl ToolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration. Replaces any function with the same name.
    pub fn with_tool(mut self, function: impl Into<String>, schema: ToolSchema, handler: ToolHandler) -> Self {
        self.insert(function, schema, handler);
        self
    }

    pub fn insert(&mut self, function: impl Into<String>, schema: ToolSchema, handler: ToolHandler) {
        self.functions
            .insert(function.into(), Arc::new(ToolFunction { schema, handler }));
    }

    pub fn get(&self, function: &str) -> Option<Arc<ToolFunction>> {
        self.functions.get(function).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.functions.values().map(|f| f.schema.clone()).collect()
    }

    /// The function whose published schema is named `tool_name`.
    pub fn function_for(&self, tool_name: &str) -> Option<&str> {
        self.functions
            .iter()
            .find(|(_, f)| f.schema.name == tool_name)
            .map(|(function, _)| function.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// The single export every plugin implements.
pub trait Plugin: Send + Sync {
    /// Produce the plugin's tool table. Called once per (re)load.
    fn register(&self) -> Result<ToolTable, PluginError>;
}
