//! The plugin registry: discovery, lifecycle and tool dispatch.
//!
//! The module table is a `RwLock<HashMap<name, Arc<PluginModule>>>`.
//! Modules are immutable once built; loading, registering and invoking all
//! happen outside the lock, and a (re)load only takes the write lock to swap
//! one `Arc`. A conversation holding a `ToolFunction` therefore keeps using
//! the version it resolved even if a reload lands mid-call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use toolweave_core::error::PluginError;
use toolweave_core::tool::{Plugin, ToolFunction, ToolSchema, ToolTable};
use tracing::{debug, info, warn};

use crate::loader::{PluginLoader, is_private};

/// Where a module came from.
#[derive(Clone)]
pub enum PluginSource {
    File(PathBuf),
    /// Compiled into the host; never polled.
    Builtin(Arc<dyn Plugin>),
}

impl std::fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Builtin(_) => f.write_str("Builtin"),
        }
    }
}

/// Load state of a tracked module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum LoadState {
    Loaded,
    /// The last reload failed; the previous tool table is still served.
    Error(String),
}

/// A loaded plugin.
#[derive(Debug)]
pub struct PluginModule {
    pub name: String,
    /// Deterministic namespace key (`plugin::<name>`)
    pub module_id: String,
    pub source: PluginSource,
    pub state: LoadState,
    pub table: ToolTable,
    /// File mtime observed right before the successful load
    pub last_modified: Option<SystemTime>,
    pub loaded_at: DateTime<Utc>,
}

impl PluginModule {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            loaded: true,
            state: self.state.clone(),
            tools: self.table.names(),
            source: match &self.source {
                PluginSource::File(p) => p.display().to_string(),
                PluginSource::Builtin(_) => "builtin".to_string(),
            },
        }
    }
}

/// Listing entry returned by [`PluginRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub loaded: bool,
    pub state: LoadState,
    pub tools: Vec<String>,
    pub source: String,
}

/// Lifecycle notifications, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReloadEvent {
    Loaded { name: String, tools: Vec<String> },
    Reloaded { name: String, tools: Vec<String> },
    Unloaded { name: String },
    Failed { name: String, reason: String },
}

/// What one hot-reload tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub reloaded: Vec<String>,
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        self.reloaded.is_empty() && self.loaded.is_empty() && self.failed.is_empty()
    }
}

pub fn module_id(name: &str) -> String {
    format!("plugin::{name}")
}

/// Registry of plugin modules backed by one directory.
pub struct PluginRegistry {
    dir: PathBuf,
    loaders: Vec<Arc<dyn PluginLoader>>,
    modules: RwLock<HashMap<String, Arc<PluginModule>>>,
    /// mtimes whose load failed; the poller waits for the next edit
    rejected: Mutex<HashMap<String, SystemTime>>,
    events: broadcast::Sender<ReloadEvent>,
    tool_timeout: Duration,
}

impl PluginRegistry {
    /// Create a registry over `dir` with no loaders registered.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            dir: dir.into(),
            loaders: Vec::new(),
            modules: RwLock::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            events,
            tool_timeout: Duration::from_secs(120),
        }
    }

    /// Set a loader for one file type.
    pub fn with_loader(mut self, loader: impl PluginLoader + 'static) -> Self {
        self.loaders.push(Arc::new(loader));
        self
    }

    /// Set the per-invocation timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ReloadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ── Discovery ──────────────────────────────────────────────────────

    /// Plugin names available in the directory. No side effects.
    pub fn discover(&self) -> BTreeSet<String> {
        self.discover_paths().into_keys().collect()
    }

    fn discover_paths(&self) -> BTreeMap<String, (PathBuf, Arc<dyn PluginLoader>)> {
        let mut found = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "Plugin directory not readable");
                return found;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_file()).collect();
        paths.sort();

        for path in paths {
            for loader in &self.loaders {
                if let Some(name) = loader.plugin_name(&path) {
                    if !is_private(&name) {
                        found.entry(name).or_insert_with(|| (path.clone(), Arc::clone(loader)));
                    }
                    break;
                }
            }
        }
        found
    }

    fn loader_for(&self, path: &Path) -> Option<Arc<dyn PluginLoader>> {
        self.loaders
            .iter()
            .find(|l| l.plugin_name(path).is_some())
            .cloned()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Register an in-process plugin under `name`.
    pub async fn register_builtin(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<PluginInfo, PluginError> {
        let table = plugin.register()?;
        let module = PluginModule {
            name: name.to_string(),
            module_id: module_id(name),
            source: PluginSource::Builtin(plugin),
            state: LoadState::Loaded,
            table,
            last_modified: None,
            loaded_at: Utc::now(),
        };
        Ok(self.install(module).await)
    }

    /// Load (or re-load) a plugin from the directory.
    ///
    /// Any prior module with the same id is evicted first, so a failure
    /// leaves the plugin absent.
    pub async fn load(&self, name: &str) -> Result<PluginInfo, PluginError> {
        let Some((path, loader)) = self.discover_paths().remove(name) else {
            self.modules.write().await.remove(name);
            return Err(PluginError::PluginNotFound(name.to_string()));
        };
        if self.modules.write().await.remove(name).is_some() {
            debug!(plugin = %name, "Evicted previous module before load");
        }

        let mtime = file_mtime(&path);
        match build_from_file(name, path, loader).await {
            Ok(module) => {
                self.clear_rejection(name);
                Ok(self.install(module).await)
            }
            Err(e) => {
                self.reject(name, mtime, &e);
                Err(e)
            }
        }
    }

    /// Rebuild a loaded plugin from its source.
    ///
    /// The new table is swapped in only if loading succeeds; on failure the
    /// previous tools stay in service and the module is marked
    /// [`LoadState::Error`]. Unknown names fall back to [`Self::load`].
    pub async fn reload(&self, name: &str) -> Result<PluginInfo, PluginError> {
        let Some(current) = self.modules.read().await.get(name).cloned() else {
            return self.load(name).await;
        };

        let (result, mtime) = match &current.source {
            PluginSource::Builtin(plugin) => {
                let result = plugin.register().map(|table| PluginModule {
                    name: name.to_string(),
                    module_id: module_id(name),
                    source: current.source.clone(),
                    state: LoadState::Loaded,
                    table,
                    last_modified: None,
                    loaded_at: Utc::now(),
                });
                (result, None)
            }
            PluginSource::File(path) => {
                let mtime = file_mtime(path);
                let result = match self.loader_for(path) {
                    Some(loader) if path.exists() => build_from_file(name, path.clone(), loader).await,
                    Some(_) => Err(PluginError::load(name, format!("{} no longer exists", path.display()))),
                    None => Err(PluginError::load(name, "no loader for file")),
                };
                (result, mtime)
            }
        };

        match result {
            Ok(module) => {
                self.clear_rejection(name);
                Ok(self.install(module).await)
            }
            Err(e) => {
                self.reject(name, mtime, &e);
                let mut modules = self.modules.write().await;
                if let Some(existing) = modules.get(name) {
                    let degraded = PluginModule {
                        name: existing.name.clone(),
                        module_id: existing.module_id.clone(),
                        source: existing.source.clone(),
                        state: LoadState::Error(e.to_string()),
                        table: existing.table.clone(),
                        last_modified: existing.last_modified,
                        loaded_at: existing.loaded_at,
                    };
                    modules.insert(name.to_string(), Arc::new(degraded));
                }
                Err(e)
            }
        }
    }

    /// Drop a plugin from the registry. Returns whether it was present.
    pub async fn unload(&self, name: &str) -> bool {
        let removed = self.modules.write().await.remove(name).is_some();
        if removed {
            info!(plugin = %name, "Plugin unloaded");
            self.publish(ReloadEvent::Unloaded { name: name.to_string() });
        }
        removed
    }

    /// Unload and forget any failure bookkeeping for `name`.
    pub async fn remove(&self, name: &str) -> bool {
        self.clear_rejection(name);
        self.unload(name).await
    }

    /// Load every discovered plugin, logging (not failing on) bad ones.
    pub async fn load_all(&self) -> Vec<PluginInfo> {
        let mut loaded = Vec::new();
        for name in self.discover() {
            match self.load(&name).await {
                Ok(info) => loaded.push(info),
                Err(e) => warn!(plugin = %name, error = %e, "Skipping plugin"),
            }
        }
        loaded
    }

    async fn install(&self, module: PluginModule) -> PluginInfo {
        let info = module.info();
        let name = module.name.clone();
        let previous = self.modules.write().await.insert(name.clone(), Arc::new(module));

        let tools = info.tools.clone();
        if previous.is_some() {
            info!(plugin = %name, tools = tools.len(), "Plugin reloaded");
            self.publish(ReloadEvent::Reloaded { name, tools });
        } else {
            info!(plugin = %name, tools = tools.len(), "Plugin loaded");
            self.publish(ReloadEvent::Loaded { name, tools });
        }
        info
    }

    fn reject(&self, name: &str, mtime: Option<SystemTime>, error: &PluginError) {
        warn!(plugin = %name, error = %error, "Plugin load failed");
        if let Some(mtime) = mtime {
            if let Ok(mut rejected) = self.rejected.lock() {
                rejected.insert(name.to_string(), mtime);
            }
        }
        self.publish(ReloadEvent::Failed {
            name: name.to_string(),
            reason: error.to_string(),
        });
    }

    fn clear_rejection(&self, name: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.remove(name);
        }
    }

    fn was_rejected(&self, name: &str, mtime: Option<SystemTime>) -> bool {
        match (mtime, self.rejected.lock()) {
            (Some(mtime), Ok(rejected)) => rejected.get(name) == Some(&mtime),
            _ => false,
        }
    }

    // ── Hot reload ─────────────────────────────────────────────────────

    /// One poll: reload stale file-backed plugins, then load new ones.
    /// Plugins whose file vanished are left alone.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        let tracked: Vec<Arc<PluginModule>> = self.modules.read().await.values().cloned().collect();
        for module in &tracked {
            let PluginSource::File(path) = &module.source else {
                continue;
            };
            let Some(mtime) = file_mtime(path) else {
                continue;
            };
            let newer = module.last_modified.is_none_or(|seen| mtime > seen);
            if !newer || self.was_rejected(&module.name, Some(mtime)) {
                continue;
            }
            debug!(plugin = %module.name, "Source modified, reloading");
            match self.reload(&module.name).await {
                Ok(_) => report.reloaded.push(module.name.clone()),
                Err(_) => report.failed.push(module.name.clone()),
            }
        }

        let known: BTreeSet<String> = self.modules.read().await.keys().cloned().collect();
        for (name, (path, _)) in self.discover_paths() {
            if known.contains(&name) || self.was_rejected(&name, file_mtime(&path)) {
                continue;
            }
            match self.load(&name).await {
                Ok(_) => report.loaded.push(name),
                Err(_) => report.failed.push(name),
            }
        }

        report.reloaded.sort();
        report.failed.sort();
        report
    }

    // ── Queries and dispatch ───────────────────────────────────────────

    pub async fn list(&self) -> Vec<PluginInfo> {
        let mut infos: Vec<PluginInfo> = self.modules.read().await.values().map(|m| m.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.modules.read().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<LoadState> {
        self.modules.read().await.get(name).map(|m| m.state.clone())
    }

    /// Service names currently loaded, sorted.
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool schemas from every loaded service, or only from `only`.
    pub async fn schemas(&self, only: Option<&[String]>) -> Vec<ToolSchema> {
        let modules = self.modules.read().await;
        let mut names: Vec<&String> = modules
            .keys()
            .filter(|n| only.is_none_or(|allowed| allowed.contains(n)))
            .collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| modules.get(n))
            .flat_map(|m| m.table.schemas())
            .collect()
    }

    /// Find the `(service, function)` pair publishing the schema `tool_name`.
    ///
    /// Exact schema names are unambiguous even when the service name or a
    /// manifest prefix contains underscores.
    pub async fn resolve_tool(&self, tool_name: &str) -> Option<(String, String)> {
        let modules = self.modules.read().await;
        let mut names: Vec<&String> = modules.keys().collect();
        names.sort();
        names.into_iter().find_map(|service| {
            let function = modules.get(service)?.table.function_for(tool_name)?;
            Some((service.clone(), function.to_string()))
        })
    }

    pub async fn get_tool(&self, service: &str, tool: &str) -> Result<Arc<ToolFunction>, PluginError> {
        let modules = self.modules.read().await;
        let module = modules
            .get(service)
            .ok_or_else(|| PluginError::PluginNotFound(service.to_string()))?;
        module.table.get(tool).ok_or_else(|| PluginError::ToolNotFound {
            service: service.to_string(),
            tool: tool.to_string(),
        })
    }

    /// Resolve and invoke a tool.
    ///
    /// Checks required parameters first, then runs the handler under the
    /// per-tool timeout. The registry lock is not held while the tool runs.
    pub async fn call(&self, service: &str, tool: &str, arguments: Value) -> Result<Value, PluginError> {
        let function = self.get_tool(service, tool).await?;

        let missing = function.schema.missing_required(&arguments);
        if !missing.is_empty() {
            return Err(PluginError::MissingArguments {
                tool: function.schema.name.clone(),
                names: missing,
            });
        }

        debug!(service = %service, tool = %tool, "Invoking tool");
        tokio::time::timeout(self.tool_timeout, function.invoke(arguments))
            .await
            .map_err(|_| PluginError::Timeout {
                tool: function.schema.name.clone(),
                timeout_secs: self.tool_timeout.as_secs(),
            })?
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn build_from_file(
    name: &str,
    path: PathBuf,
    loader: Arc<dyn PluginLoader>,
) -> Result<PluginModule, PluginError> {
    let owned = name.to_string();
    let last_modified = file_mtime(&path);
    let source_path = path.clone();

    let table = tokio::task::spawn_blocking(move || -> Result<ToolTable, PluginError> {
        let plugin = loader.load(&owned, &path)?;
        plugin.register()
    })
    .await
    .map_err(|e| PluginError::load(name, format!("loader panicked: {e}")))??;

    Ok(PluginModule {
        name: name.to_string(),
        module_id: module_id(name),
        source: PluginSource::File(source_path),
        state: LoadState::Loaded,
        table,
        last_modified,
        loaded_at: Utc::now(),
    })
}
