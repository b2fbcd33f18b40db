// ABOUTME: CLI entry point for docdb-cdc
// ABOUTME: Parses commands, sets up logging and routes to the feed commands

use clap::{Parser, Subcommand};
use docdb_cdc::commands::{self, FeedArgs};

#[derive(Parser)]
#[command(name = "docdb-cdc")]
#[command(about = "Change data capture from Cosmos DB and MongoDB with resumable checkpoints")]
#[command(long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture pending changes once, then exit
    Capture {
        #[command(flatten)]
        feed: FeedArgs,
    },
    /// Capture continuously until interrupted
    ///
    /// Poll backends (Cosmos DB) repeat a capture every interval; subscription
    /// backends (MongoDB) keep one change stream open.
    Listen {
        #[command(flatten)]
        feed: FeedArgs,
        /// Milliseconds between poll cycles (default 5000)
        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log. Logs go to stderr so stdout carries only change data
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Capture { feed } => commands::capture(feed).await,
        Commands::Listen { feed, interval_ms } => commands::listen(feed, interval_ms).await,
    }
}
