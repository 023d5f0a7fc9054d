//! Shared wiring: config, chunk store and plugin registry.

use std::sync::Arc;
use std::time::Duration;

use toolweave_chunks::{ChunkStore, DataProcPlugin, SERVICE};
use toolweave_config::AppConfig;
use toolweave_plugins::{PluginRegistry, registry_from_config};
use tracing::info;

pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<ChunkStore>,
    pub registry: Arc<PluginRegistry>,
}

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

pub fn store(config: &AppConfig) -> Arc<ChunkStore> {
    Arc::new(ChunkStore::from_config(&config.chunks))
}

/// Build the registry with the chunk-store plugin and every plugin file
/// in the configured directory.
pub async fn load() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = load_config()?;
    let store = store(&config);
    let registry = Arc::new(registry_from_config(
        &config.plugins,
        Duration::from_secs(config.agent.tool_timeout_secs),
    ));
    registry
        .register_builtin(SERVICE, Arc::new(DataProcPlugin::new(Arc::clone(&store))))
        .await?;
    let loaded = registry.load_all().await;
    info!(
        dir = %config.plugins.dir.display(),
        plugins = loaded.len(),
        "Plugins loaded"
    );
    Ok(Runtime {
        config,
        store,
        registry,
    })
}
