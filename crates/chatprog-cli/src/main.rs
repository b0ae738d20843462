//! chatprog command-line interface.
//!
//! Runs the chat server or a terminal client against one.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

/// CPP group chat: server and terminal client.
#[derive(Parser)]
#[command(name = "chatprog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Listen port
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Name admitted with manager permissions (repeatable)
        #[arg(long = "manager")]
        managers: Vec<String>,

        /// Control-loop tick interval in milliseconds
        #[arg(long, default_value = "50")]
        tick_ms: u64,
    },

    /// Connect to a chat server
    Chat {
        /// Server host
        host: String,

        /// Name to join with
        name: String,

        /// Server port
        #[arg(short, long, default_value = "8000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            port,
            managers,
            tick_ms,
        } => commands::serve(bind, port, managers, tick_ms).await,
        Commands::Chat { host, name, port } => commands::chat(&host, &name, port).await,
    }
}
