// ABOUTME: capture and listen commands: resolve config, connect, and run the feed
// ABOUTME: Changes go to stdout or an output file as JSON lines, logs go to stderr

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::config::{CdcConfig, ConfigOverrides};
use crate::factory::{create_service, BackendKind};
use crate::runner::{ConnectedService, FeedRunner};
use crate::sink::JsonLinesSink;

#[derive(Args, Clone, Debug, Default)]
pub struct FeedArgs {
    /// TOML file with [source], [change_feed] and [capture] sections
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend type: CosmosDB, MongoDB or PostgreSQL
    #[arg(long)]
    pub backend: Option<BackendKind>,
    /// Backend connection string
    #[arg(long, env = "CDC_CONNECTION_STRING", hide_env_values = true)]
    pub connection: Option<String>,
    /// Database holding the source
    #[arg(long)]
    pub database: Option<String>,
    /// Container or collection to capture
    #[arg(long)]
    pub source: Option<String>,
    /// Resource holding checkpoints (default: cdc-data-lease, created on demand)
    #[arg(long)]
    pub checkpoint_resource: Option<String>,
    /// Prefix namespacing this consumer's checkpoint
    #[arg(long)]
    pub prefix: Option<String>,
    /// Create the named checkpoint resource if it does not exist
    #[arg(long, default_value_t = false)]
    pub create_checkpoint_resource: bool,
    /// Stop capturing after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Items per change feed page (poll backends)
    #[arg(long)]
    pub page_size: Option<u32>,
    /// Append changes to this file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl FeedArgs {
    fn resolve(&self, listen_interval_ms: Option<u64>) -> Result<CdcConfig> {
        let base = match &self.config {
            Some(path) => Some(CdcConfig::load(path)?),
            None => None,
        };
        let overrides = ConfigOverrides {
            backend: self.backend,
            connection: self.connection.clone(),
            database: self.database.clone(),
            source: self.source.clone(),
            checkpoint_resource: self.checkpoint_resource.clone(),
            prefix: self.prefix.clone(),
            create_checkpoint_resource: self.create_checkpoint_resource,
            timeout_ms: self.timeout_ms,
            page_size: self.page_size,
            listen_interval_ms,
        };
        overrides.apply(base)
    }
}

async fn open_sink(output: Option<&Path>) -> Result<JsonLinesSink> {
    match output {
        Some(path) => JsonLinesSink::append_to(path).await,
        None => Ok(JsonLinesSink::stdout()),
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Interrupt received, finishing current work"),
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });
    token
}

/// One bounded capture invocation.
pub async fn capture(args: FeedArgs) -> Result<()> {
    let config = args.resolve(None)?;
    let service = create_service(config.source.kind)?;
    let sink = open_sink(args.output.as_deref()).await?;

    let client = service
        .connect(&config.connection_config())
        .await
        .with_context(|| format!("Failed to connect to {}", config.source.kind))?;
    let processor = ConnectedService {
        service: &service,
        client: &client,
    };
    let runner = FeedRunner::new(&processor, config.feed_request(), config.listen_interval());

    let summary = runner.run_once(&sink, shutdown_on_ctrl_c()).await?;
    eprintln!(
        "Captured {} record(s) in {} batch(es) from {}.{} ({:?})",
        summary.records_delivered,
        summary.batches_delivered,
        config.source.db_name,
        config.source.resource_name,
        summary.stop_reason
    );
    Ok(())
}

/// Capture continuously until Ctrl-C.
pub async fn listen(args: FeedArgs, interval_ms: Option<u64>) -> Result<()> {
    let config = args.resolve(interval_ms)?;
    let service = create_service(config.source.kind)?;
    let sink = open_sink(args.output.as_deref()).await?;

    let client = service
        .connect(&config.connection_config())
        .await
        .with_context(|| format!("Failed to connect to {}", config.source.kind))?;
    let processor = ConnectedService {
        service: &service,
        client: &client,
    };
    let runner = FeedRunner::new(&processor, config.feed_request(), config.listen_interval());

    let stats = runner.listen(&sink, shutdown_on_ctrl_c()).await?;
    eprintln!(
        "Listened for {}ms: {} cycle(s), {} failed, {} record(s)",
        stats.duration_ms, stats.cycles, stats.failed_cycles, stats.records_delivered
    );
    if !stats.is_success() {
        tracing::warn!(
            "{} of {} capture cycle(s) failed; last error: {}",
            stats.failed_cycles,
            stats.cycles,
            stats.last_error.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
