//! toolweave CLI: the main entry point.
//!
//! Commands:
//! - `chat`    : interactive or single-message chat with tool use
//! - `plugins` : list plugins, optionally watching for hot reloads
//! - `chunks`  : inspect and manage the chunk store's tasks
//! - `config`  : create or print the configuration file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolweave",
    about = "toolweave: tool-calling LLM orchestration with hot-reloadable plugins",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the model
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Activate a skill by name (repeatable); disables prompt matching
        #[arg(long = "skill")]
        skills: Vec<String>,

        /// Only offer tools from this service (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,
    },

    /// List loaded plugins
    Plugins {
        /// Keep running and print hot-reload events
        #[arg(short, long)]
        watch: bool,
    },

    /// Inspect chunk processing tasks
    Chunks {
        #[command(subcommand)]
        action: ChunksAction,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ChunksAction {
    /// Progress of a task (default: the current one)
    Status { task: Option<String> },
    /// Show the next unprocessed chunk
    Next { task: Option<String> },
    /// Print the merged summaries
    Merge { task: Option<String> },
    /// Delete every chunk, task and summary
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "toolweave=debug" } else { "toolweave=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Commands::Chat {
            message,
            skills,
            services,
        } => commands::chat::run(message, skills, services).await?,
        Commands::Plugins { watch } => commands::plugins::run(watch).await?,
        Commands::Chunks { action } => match action {
            ChunksAction::Status { task } => commands::chunks::status(task).await?,
            ChunksAction::Next { task } => commands::chunks::next(task).await?,
            ChunksAction::Merge { task } => commands::chunks::merge(task).await?,
            ChunksAction::Clear => commands::chunks::clear().await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
        },
    }

    Ok(())
}
