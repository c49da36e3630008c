//! FreeQuota CLI - inspect and drive the free-plan quota engine
//!
//! Every invocation is one execution context over a shared store file, so
//! several terminals running `freequota` behave like several browser tabs.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "freequota")]
#[command(author, version, about = "Free-plan quota synchronization CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Subject (account) the quota belongs to
    #[arg(long, env = "FREEQUOTA_SUBJECT", global = true)]
    subject: Option<String>,

    /// Metered resource kind
    #[arg(long, global = true, default_value = "ai_chat")]
    kind: freequota_core::ResourceKind,

    /// Free-plan limit (default: FREEQUOTA_LIMIT or 5)
    #[arg(long, global = true)]
    limit: Option<u32>,

    /// Treat the subject as exempt (premium)
    #[arg(long, global = true)]
    exempt: bool,

    /// Override store file path (or set FREEQUOTA_STORE_PATH env var)
    #[arg(long, global = true)]
    store: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local quota view
    Status,

    /// Fetch the authoritative count from the server
    Sync,

    /// Ask the assistant a question (one metered action)
    Ask {
        /// Question to send
        message: String,

        /// Server-side counting scope (defaults to the subject)
        #[arg(long)]
        scope: Option<String>,
    },

    /// Charge one action locally without contacting the server
    Bump,

    /// Undo one local charge
    Rollback,

    /// Overwrite the count with an authoritative value
    Set {
        /// New count, validated like a server response
        value: String,
    },

    /// Print every change made by other contexts until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let mut config = freequota_core::ClientConfig::from_env()?;
    if let Some(store) = &cli.store {
        config = config.with_store_path(store);
    }

    // Create context for commands
    let ctx = commands::Context::new(
        config,
        cli.format,
        cli.quiet,
        cli.subject,
        cli.kind,
        cli.limit,
        cli.exempt,
    );

    // Execute command
    match cli.command {
        Commands::Status => commands::status::show(&ctx).await,
        Commands::Sync => commands::remote::sync(&ctx).await,
        Commands::Ask { message, scope } => commands::remote::ask(&ctx, message, scope).await,
        Commands::Bump => commands::counter::bump(&ctx).await,
        Commands::Rollback => commands::counter::rollback(&ctx).await,
        Commands::Set { value } => commands::counter::set(&ctx, value).await,
        Commands::Watch => commands::watch::execute(&ctx).await,
    }
}
