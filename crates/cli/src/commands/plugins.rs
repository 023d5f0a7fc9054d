//! `toolweave plugins`: list plugins, optionally following hot reloads.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use toolweave_plugins::{HotReloader, LoadState, ReloadEvent};

use super::runtime;

pub async fn run(watch: bool) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime::load().await?;
    let registry = &rt.registry;

    println!("Plugin directory: {}", registry.dir().display());
    let plugins = registry.list().await;
    if plugins.is_empty() {
        println!("  (no plugins)");
    }
    for info in &plugins {
        let state = match &info.state {
            LoadState::Loaded => "loaded".to_string(),
            LoadState::Error(reason) => format!("error: {reason}"),
        };
        println!("  {:<20} {:<8} {}", info.name, state, info.source);
        for tool in &info.tools {
            println!("      - {tool}");
        }
    }

    if !watch {
        return Ok(());
    }

    let interval = rt.config.plugins.poll_interval();
    let mut events = registry.subscribe();
    let reloader = HotReloader::new(Arc::clone(registry), interval);
    reloader.start().await;
    println!();
    println!("Watching for changes every {}ms (Ctrl+C to stop)...", interval.as_millis());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(n)) => println!("  ({n} events skipped)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    reloader.stop().await;
    Ok(())
}

fn describe(event: &ReloadEvent) -> String {
    match event {
        ReloadEvent::Loaded { name, tools } => format!("  + {name} loaded ({} tools)", tools.len()),
        ReloadEvent::Reloaded { name, tools } => format!("  ~ {name} reloaded ({} tools)", tools.len()),
        ReloadEvent::Unloaded { name } => format!("  - {name} unloaded"),
        ReloadEvent::Failed { name, reason } => format!("  ! {name} failed: {reason}"),
    }
}
