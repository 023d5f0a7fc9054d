//! Declarative JSON plugins (`<name>.plugin.json`).
//!
//! A manifest lists tools with their JSON-Schema parameters. Each tool is
//! backed either by a `template` (string interpolation, runs synchronously)
//! or by a `command` (a subprocess, awaited):
//!
//! ```json
//! {
//!   "description": "Host utilities",
//!   "tools": [
//!     { "name": "greet", "description": "Greets someone",
//!       "parameters": { "type": "object",
//!                       "properties": { "name": { "type": "string" } },
//!                       "required": ["name"] },
//!       "template": "Hello, {name}!" },
//!     { "name": "disk", "description": "Disk usage of a path",
//!       "parameters": { "type": "object",
//!                       "properties": { "path": { "type": "string", "default": "." } } },
//!       "command": ["du", "-sh", "{path}"], "timeout_secs": 10 }
//!   ]
//! }
//! ```
//!
//! Placeholders are `{arg}`; string arguments are substituted verbatim and
//! anything else as compact JSON. Missing arguments fall back to the
//! schema's `default`, then to an empty string.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use toolweave_core::error::PluginError;
use toolweave_core::tool::{Plugin, ToolHandler, ToolSchema, ToolTable};
use tracing::{debug, warn};

use crate::loader::{PluginLoader, stem_with_suffix};

const SUFFIX: &str = ".plugin.json";

/// Loads `*.plugin.json` manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestLoader;

impl PluginLoader for ManifestLoader {
    fn plugin_name(&self, path: &Path) -> Option<String> {
        stem_with_suffix(path, SUFFIX)
    }

    fn load(&self, name: &str, path: &Path) -> Result<Box<dyn Plugin>, PluginError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PluginError::load(name, format!("read {}: {e}", path.display())))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| PluginError::load(name, format!("invalid manifest: {e}")))?;
        manifest.check(name)?;
        Ok(Box::new(ManifestPlugin {
            service: manifest.prefix.clone().unwrap_or_else(|| name.to_string()),
            manifest,
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    #[serde(default)]
    description: String,

    /// Overrides the tool-name prefix (defaults to the plugin name)
    #[serde(default)]
    prefix: Option<String>,

    #[serde(default)]
    tools: Vec<ManifestTool>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "empty_object_schema")]
    parameters: Value,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default = "default_command_timeout")]
    timeout_secs: u64,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn default_command_timeout() -> u64 {
    30
}

impl Manifest {
    fn check(&self, plugin: &str) -> Result<(), PluginError> {
        for tool in &self.tools {
            match (&tool.template, &tool.command) {
                (Some(_), None) => {}
                (None, Some(argv)) if !argv.is_empty() => {}
                _ => {
                    return Err(PluginError::load(
                        plugin,
                        format!("tool '{}' needs exactly one of 'template' or a non-empty 'command'", tool.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

struct ManifestPlugin {
    service: String,
    manifest: Manifest,
}

impl Plugin for ManifestPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        let mut table = ToolTable::new();
        for tool in &self.manifest.tools {
            let schema = ToolSchema::new(
                format!("{}_{}", self.service, tool.name),
                tool.description.clone(),
                tool.parameters.clone(),
            );
            let handler = match (&tool.template, &tool.command) {
                (Some(template), _) => template_handler(template.clone(), tool.parameters.clone()),
                (None, Some(argv)) => command_handler(
                    schema.name.clone(),
                    argv.clone(),
                    tool.parameters.clone(),
                    Duration::from_secs(tool.timeout_secs),
                ),
                (None, None) => continue,
            };
            table.insert(tool.name.clone(), schema, handler);
        }
        debug!(
            service = %self.service,
            description = %self.manifest.description,
            tools = table.len(),
            "Manifest plugin registered"
        );
        Ok(table)
    }
}

fn template_handler(template: String, parameters: Value) -> ToolHandler {
    ToolHandler::sync(move |args| Ok(json!({ "result": interpolate(&template, &args, &parameters) })))
}

fn command_handler(tool: String, argv: Vec<String>, parameters: Value, timeout: Duration) -> ToolHandler {
    ToolHandler::async_fn(move |args| {
        let tool = tool.clone();
        let argv: Vec<String> = argv.iter().map(|a| interpolate(a, &args, &parameters)).collect();
        async move {
            let (program, rest) = argv
                .split_first()
                .ok_or_else(|| PluginError::invocation(&tool, "empty command"))?;

            debug!(tool = %tool, program = %program, "Running plugin command");
            let output = tokio::time::timeout(timeout, Command::new(program).args(rest).output())
                .await
                .map_err(|_| PluginError::Timeout {
                    tool: tool.clone(),
                    timeout_secs: timeout.as_secs(),
                })?
                .map_err(|e| PluginError::invocation(&tool, e))?;

            let success = output.status.success();
            let code = output.status.code().unwrap_or(-1);
            if !success {
                warn!(tool = %tool, exit_code = code, "Plugin command failed");
            }
            Ok(json!({
                "success": success,
                "exit_code": code,
                "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
                "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
            }))
        }
    })
}

/// Replace `{key}` placeholders with argument values.
fn interpolate(template: &str, args: &Value, parameters: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_ident(&after[..close]) => {
                let key = &after[..close];
                let value = args
                    .get(key)
                    .filter(|v| !v.is_null())
                    .or_else(|| parameters.pointer(&format!("/properties/{key}/default")));
                match value {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {}
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
