//! Hearth CLI - keeps a local inference server and its chat going.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// Hearth - a local inference keeper
#[derive(Parser)]
#[command(name = "hearth")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage models
    Model {
        #[command(subcommand)]
        command: ModelCommands,
    },

    /// Chat with the selected model
    Chat {
        /// Message to send; without one, an unanswered message is replayed
        message: Option<String>,
        /// Clear the conversation before sending
        #[arg(long)]
        reset: bool,
        /// Print the reply as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// Show paths and settings
    Info,
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List models in the catalog
    List,
    /// Download a model and select it
    Pull {
        /// Model id
        id: String,
    },
    /// Delete a downloaded model
    Remove {
        /// Model id
        id: String,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let settings = hearth_session::SessionSettings::from_env();
    if let Commands::Info = cli.command {
        return commands::info::run(&settings);
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?;
    runtime.block_on(async move {
        match cli.command {
            Commands::Model { command } => match command {
                ModelCommands::List => commands::model::list(settings).await,
                ModelCommands::Pull { id } => commands::model::pull(settings, &id).await,
                ModelCommands::Remove { id } => commands::model::remove(settings, &id).await,
            },
            Commands::Chat {
                message,
                reset,
                stream,
            } => commands::chat::run(settings, message, reset, stream).await,
            Commands::Info => Ok(()),
        }
    })
}
