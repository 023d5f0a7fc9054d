//! Background poller that keeps the registry in sync with the plugin
//! directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::PluginRegistry;

/// Periodically calls [`PluginRegistry::poll_once`].
///
/// `start` and `stop` are idempotent. `stop` lets an in-flight poll finish
/// and waits for the task to exit before returning.
pub struct HotReloader {
    registry: Arc<PluginRegistry>,
    interval: Duration,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HotReloader {
    pub fn new(registry: Arc<PluginRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Start polling. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the startup load
            // is not repeated.
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = registry.poll_once().await;
                        if !report.is_empty() {
                            info!(
                                reloaded = ?report.reloaded,
                                loaded = ?report.loaded,
                                failed = ?report.failed,
                                "Plugin directory changed"
                            );
                        }
                    }
                }
            }
            debug!("Hot reload poller exited");
        });

        info!(interval_ms = period.as_millis() as u64, "Plugin hot reload started");
        *running = Some((stop_tx, handle));
        true
    }

    /// Stop polling. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some((stop_tx, handle)) = self.running.lock().await.take() else {
            return false;
        };
        let _ = stop_tx.send(true);
        drop(stop_tx);
        let _ = handle.await;
        info!("Plugin hot reload stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}
