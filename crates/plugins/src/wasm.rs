//! WebAssembly plugins (`<name>.wasm`), enabled by the `wasm` feature.
//!
//! A module is instantiated with an empty linker (no WASI, no host imports)
//! and must export:
//!
//! - `memory`
//! - `alloc(len: i32) -> i32`
//! - `register() -> i32`: pointer to a NUL-terminated JSON array of
//!   `{name, description, parameters}` objects, `name` already namespaced
//!   as `<service>_<function>`
//! - `execute(ptr: i32, len: i32) -> i32`: receives
//!   `{"tool": "<function>", "arguments": {...}}` and returns a pointer to a
//!   NUL-terminated JSON result (non-JSON output is returned as a string)
//!
//! Every call gets a fresh store, so no state survives between invocations.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, Store};

use toolweave_core::error::PluginError;
use toolweave_core::tool::{Plugin, ToolHandler, ToolSchema, ToolTable};

use crate::loader::{PluginLoader, stem_with_suffix};

const DEFAULT_MAX_FUEL: u64 = 1_000_000_000;

/// Loads `*.wasm` modules.
#[derive(Debug, Clone)]
pub struct WasmLoader {
    max_fuel: u64,
}

impl Default for WasmLoader {
    fn default() -> Self {
        Self {
            max_fuel: DEFAULT_MAX_FUEL,
        }
    }
}

impl WasmLoader {
    /// Instruction budget per call; 0 disables metering.
    pub fn with_max_fuel(mut self, max_fuel: u64) -> Self {
        self.max_fuel = max_fuel;
        self
    }
}

impl PluginLoader for WasmLoader {
    fn plugin_name(&self, path: &Path) -> Option<String> {
        stem_with_suffix(path, ".wasm")
    }

    fn load(&self, name: &str, path: &Path) -> Result<Box<dyn Plugin>, PluginError> {
        let bytes = std::fs::read(path).map_err(|e| PluginError::load(name, format!("read {}: {e}", path.display())))?;
        Ok(Box::new(WasmPlugin::from_bytes(name, &bytes, self.max_fuel)?))
    }
}

struct Sandbox {
    plugin: String,
    engine: Engine,
    module: Module,
    max_fuel: u64,
}

/// A compiled module, shared by every tool it publishes.
pub struct WasmPlugin {
    sandbox: Arc<Sandbox>,
}

impl WasmPlugin {
    pub fn from_bytes(name: &str, bytes: &[u8], max_fuel: u64) -> Result<Self, PluginError> {
        let mut config = Config::new();
        config.consume_fuel(max_fuel > 0);
        let engine = Engine::new(&config).map_err(|e| PluginError::load(name, format!("engine: {e}")))?;
        let module = Module::new(&engine, bytes).map_err(|e| PluginError::load(name, format!("compile: {e}")))?;
        debug!(plugin = %name, max_fuel, "WASM module compiled");
        Ok(Self {
            sandbox: Arc::new(Sandbox {
                plugin: name.to_string(),
                engine,
                module,
                max_fuel,
            }),
        })
    }
}

impl Plugin for WasmPlugin {
    fn register(&self) -> Result<ToolTable, PluginError> {
        let sandbox = &self.sandbox;
        let raw = sandbox
            .call_register()
            .map_err(|reason| PluginError::load(&sandbox.plugin, reason))?;
        let listed: Value = serde_json::from_str(&raw)
            .map_err(|e| PluginError::load(&sandbox.plugin, format!("register() returned invalid JSON: {e}")))?;
        let entries = listed
            .as_array()
            .ok_or_else(|| PluginError::load(&sandbox.plugin, "register() must return a JSON array"))?;

        let mut table = ToolTable::new();
        for entry in entries {
            let schema = ToolSchema::from_json(entry)
                .ok_or_else(|| PluginError::load(&sandbox.plugin, "tool entry without a name"))?;
            let function = schema
                .name
                .split_once('_')
                .map(|(_, f)| f.to_string())
                .unwrap_or_else(|| schema.name.clone());

            let tool_sandbox = Arc::clone(sandbox);
            let tool_name = schema.name.clone();
            let call_function = function.clone();
            let handler = ToolHandler::sync(move |arguments| {
                let input = json!({"tool": call_function, "arguments": arguments}).to_string();
                let output = tool_sandbox
                    .call_execute(&input)
                    .map_err(|reason| PluginError::invocation(&tool_name, reason))?;
                Ok(serde_json::from_str(&output).unwrap_or(Value::String(output)))
            });
            table.insert(function, schema, handler);
        }
        Ok(table)
    }
}

impl Sandbox {
    fn instantiate(&self) -> Result<(Store<()>, Instance, Memory), String> {
        let mut store = Store::new(&self.engine, ());
        if self.max_fuel > 0 {
            store.set_fuel(self.max_fuel).map_err(|e| format!("set fuel: {e}"))?;
        }
        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| format!("instantiation failed: {e}"))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| "module must export 'memory'".to_string())?;
        Ok((store, instance, memory))
    }

    fn call_register(&self) -> Result<String, String> {
        let (mut store, instance, memory) = self.instantiate()?;
        let register = instance
            .get_typed_func::<(), i32>(&mut store, "register")
            .map_err(|e| format!("module must export 'register() -> i32': {e}"))?;
        let ptr = register.call(&mut store, ()).map_err(|e| trap_reason(&e))?;
        read_c_string(&memory, &store, ptr)
    }

    fn call_execute(&self, input: &str) -> Result<String, String> {
        let (mut store, instance, memory) = self.instantiate()?;

        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| format!("module must export 'alloc(i32) -> i32': {e}"))?;
        let len = i32::try_from(input.len()).map_err(|_| "input too large".to_string())?;
        let ptr = alloc.call(&mut store, len).map_err(|e| trap_reason(&e))?;

        let start = usize::try_from(ptr).map_err(|_| "alloc returned a negative pointer".to_string())?;
        let data = memory.data_mut(&mut store);
        let end = start + input.len();
        if end > data.len() {
            return Err("input too large for module memory".into());
        }
        data[start..end].copy_from_slice(input.as_bytes());

        let execute = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "execute")
            .map_err(|e| format!("module must export 'execute(i32, i32) -> i32': {e}"))?;
        let out = execute.call(&mut store, (ptr, len)).map_err(|e| trap_reason(&e))?;
        read_c_string(&memory, &store, out)
    }
}

fn trap_reason(e: &wasmtime::Error) -> String {
    let text = format!("{e:#}");
    if text.contains("fuel") {
        "execution exceeded fuel limit".to_string()
    } else {
        format!("trap: {text}")
    }
}

fn read_c_string(memory: &Memory, store: &Store<()>, ptr: i32) -> Result<String, String> {
    let data = memory.data(store);
    let start = usize::try_from(ptr).map_err(|_| "negative result pointer".to_string())?;
    if start >= data.len() {
        return Err("result pointer out of bounds".into());
    }
    let end = data[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(data.len(), |pos| start + pos);
    std::str::from_utf8(&data[start..end])
        .map(str::to_string)
        .map_err(|e| format!("invalid UTF-8 in module output: {e}"))
}
