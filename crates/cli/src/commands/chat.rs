//! `toolweave chat`: interactive or single-message chat mode.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use toolweave_agent::{ChatEvent, ChatRequest, Orchestrator};
use toolweave_config::AppConfig;
use toolweave_core::message::Message;
use toolweave_plugins::HotReloader;

use super::runtime;

pub async fn run(
    message: Option<String>,
    skills: Vec<String>,
    services: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime::load().await?;
    let config = &rt.config;

    if !config.has_api_key() && config.provider.name != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    TOOLWEAVE_API_KEY = 'sk-...'");
        eprintln!("    OPENAI_API_KEY    = 'sk-...'");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = toolweave_providers::build_from_config(&config.provider)?;
    let orchestrator = Orchestrator::from_config(config, provider, Arc::clone(&rt.registry), Arc::clone(&rt.store));

    let request_for = |prompt: String, history: Vec<Message>| {
        let mut request = ChatRequest::new(prompt).with_history(history);
        if !skills.is_empty() {
            request = request.with_skills(skills.clone());
        }
        if !services.is_empty() {
            request = request.with_services(services.clone());
        }
        request
    };

    if let Some(msg) = message {
        chat_once(&orchestrator, request_for(msg, Vec::new())).await?;
        return Ok(());
    }

    let reloader = HotReloader::new(Arc::clone(&rt.registry), config.plugins.poll_interval());
    if config.plugins.hot_reload {
        reloader.start().await;
    }

    println!();
    println!("  toolweave: interactive mode");
    println!();
    println!("  Provider:  {}", config.provider.name);
    println!("  Model:     {}", config.provider.model);
    println!("  Plugins:   {}", rt.registry.services().await.join(", "));
    println!("  Skills:    {}", orchestrator.skills().len());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<Message> = Vec::new();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        match chat_once(&orchestrator, request_for(line.to_string(), history.clone())).await {
            Ok(messages) => history = messages,
            // Already shown through the error event.
            Err(e) => tracing::debug!(error = %e, "Prompt failed"),
        }
    }

    reloader.stop().await;
    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Run one prompt, printing events as they arrive. Returns the history
/// without its system prompt, ready for the next prompt.
async fn chat_once(
    orchestrator: &Orchestrator,
    request: ChatRequest,
) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::channel(64);
    let run = async move {
        let result = orchestrator.run(request, &tx).await;
        drop(tx);
        result
    };
    let (result, ()) = tokio::join!(run, render(rx));
    let reply = result?;
    Ok(reply.messages.into_iter().skip(1).collect())
}

async fn render(mut rx: mpsc::Receiver<ChatEvent>) {
    let mut out = std::io::stdout();
    let mut answering = false;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Think { content } => eprint!("\x1b[2m{content}\x1b[0m"),
            ChatEvent::Say { content, partial } => {
                if partial {
                    if !answering {
                        print!("\n  Assistant > ");
                        answering = true;
                    }
                    print!("{content}");
                    let _ = out.flush();
                } else {
                    println!();
                    answering = false;
                }
            }
            ChatEvent::ToolCall { name, arguments, .. } => {
                eprintln!("\n  -> {name} {arguments}");
            }
            ChatEvent::ToolResult { name, result, success, .. } => {
                let mark = if success { "ok" } else { "failed" };
                let first_line = result.lines().next().unwrap_or_default();
                eprintln!("  <- {name} [{mark}] {first_line}");
            }
            ChatEvent::ProcessInfo { message } => eprintln!("  [info] {message}"),
            ChatEvent::Complete { stats, .. } => {
                eprintln!(
                    "\n  [{} tokens, {} api calls, {} tool calls, {:.1}s]\n",
                    stats.total_tokens, stats.api_calls, stats.tool_calls, stats.elapsed_secs
                );
            }
            ChatEvent::Error { message, stats } => {
                eprintln!(
                    "\n  [Error] {message} ({} tokens, {} api calls)\n",
                    stats.total_tokens, stats.api_calls
                );
            }
        }
    }
}
