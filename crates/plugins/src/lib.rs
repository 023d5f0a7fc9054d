//! Plugin registry for toolweave.
//!
//! Plugins live as files in one directory. A [`PluginLoader`] turns a file
//! into a [`Plugin`](toolweave_core::Plugin); the [`PluginRegistry`] tracks
//! what is loaded, dispatches tool calls, and rebuilds modules whose file
//! changed. [`HotReloader`] runs that check on a timer.
//!
//! Built-in loaders:
//!
//! - [`ManifestLoader`]: declarative `*.plugin.json` files
//! - `WasmLoader`: sandboxed `*.wasm` modules (feature `wasm`)

pub mod hot_reload;
pub mod loader;
pub mod manifest;
pub mod registry;

#[cfg(feature = "wasm")]
pub mod wasm;

use std::time::Duration;

use toolweave_config::PluginsConfig;

pub use hot_reload::HotReloader;
pub use loader::PluginLoader;
pub use manifest::ManifestLoader;
pub use registry::{LoadState, PluginInfo, PluginModule, PluginRegistry, PluginSource, PollReport, ReloadEvent};

#[cfg(feature = "wasm")]
pub use wasm::{WasmLoader, WasmPlugin};

/// A registry over the configured plugin directory with every compiled-in
/// loader attached.
pub fn registry_from_config(config: &PluginsConfig, tool_timeout: Duration) -> PluginRegistry {
    let registry = PluginRegistry::new(config.dir.clone())
        .with_loader(ManifestLoader)
        .with_tool_timeout(tool_timeout);
    #[cfg(feature = "wasm")]
    let registry = registry.with_loader(WasmLoader::default());
    registry
}
