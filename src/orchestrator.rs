// ABOUTME: CDC orchestrator sequencing resolution steps before capture
// ABOUTME: Resolves database, source and checkpoint store, then hands off to the engine

use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureContext, CaptureEngine, CaptureMode, CaptureOptions, CaptureSummary};
use crate::checkpoint::{CheckpointNaming, CheckpointStore};
use crate::connection::{ConnectionConfig, ConnectionLayer};
use crate::error::{ResourceKind, Result};
use crate::sink::Sink;

/// What to capture in one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRequest {
    pub database: String,
    pub source: String,
    /// Checkpoint resource to use; the naming policy's default when `None`.
    pub checkpoint_resource: Option<String>,
    pub options: CaptureOptions,
}

impl FeedRequest {
    pub fn new(database: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_checkpoint_resource(mut self, name: impl Into<String>) -> Self {
        self.checkpoint_resource = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }
}

/// Lifecycle of one invocation. Every state before `Capturing` is a pure resolution
/// step that may abort the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Idle,
    Connected,
    ResourceResolved,
    CheckpointResolved,
    Capturing,
    Closed,
}

/// Sequences handle resolution and checkpoint lookup, then runs the capture engine.
/// Depends only on the connection layer and engine contracts, never on a backend type.
pub struct CdcOrchestrator<L, E> {
    layer: L,
    engine: E,
    naming: CheckpointNaming,
}

impl<L, E> CdcOrchestrator<L, E>
where
    L: ConnectionLayer,
    E: CaptureEngine<L>,
{
    pub fn new(layer: L, engine: E) -> Self {
        Self::with_naming(layer, engine, CheckpointNaming::default())
    }

    pub fn with_naming(layer: L, engine: E, naming: CheckpointNaming) -> Self {
        Self {
            layer,
            engine,
            naming,
        }
    }

    pub fn layer(&self) -> &L {
        &self.layer
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.engine.mode()
    }

    /// Open a client. The caller owns it and may reuse it across invocations.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<L::Client> {
        let client = self.layer.connect(config).await?;
        tracing::info!("Connected to {}", self.layer.backend_name());
        self.transition(FeedState::Idle, FeedState::Connected);
        Ok(client)
    }

    /// Run one capture invocation, failing fast on the first error.
    ///
    /// No step is retried here; on failure nothing was checkpointed for the failing unit.
    pub async fn process_change_feed(
        &self,
        client: &L::Client,
        request: &FeedRequest,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        let mut state = FeedState::Connected;
        let backend = self.layer.backend_name();

        let database = self
            .layer
            .resolve_database(client, &request.database)
            .await?;
        let source = self
            .layer
            .resolve_resource(&database, &request.source)
            .await
            .map_err(|e| e.for_resource(ResourceKind::Source))?;
        state = self.transition(state, FeedState::ResourceResolved);

        let checkpoint_resource = match request.checkpoint_resource.as_deref() {
            Some(name) => {
                self.resolve_named_checkpoint_resource(&database, name, request)
                    .await?
            }
            None => {
                let name = self.naming.default_resource;
                tracing::info!("No checkpoint resource named, using '{}'", name);
                self.layer
                    .create_resource_if_absent(&database, name)
                    .await
                    .map_err(|e| e.for_resource(ResourceKind::CheckpointResource))?
            }
        };

        let record_id = self
            .naming
            .record_id(&request.source, request.options.prefix.as_deref());
        let checkpoints = CheckpointStore::new(&self.layer, &checkpoint_resource, record_id);
        let start_token = checkpoints.load().await?;
        match &start_token {
            Some(_) => tracing::info!(
                "Found checkpoint '{}' for {}.{}",
                checkpoints.id(),
                request.database,
                request.source
            ),
            None => tracing::info!(
                "No checkpoint '{}' yet for {}.{}, starting fresh",
                checkpoints.id(),
                request.database,
                request.source
            ),
        }
        state = self.transition(state, FeedState::CheckpointResolved);

        let ctx = CaptureContext {
            layer: &self.layer,
            source: &source,
            source_name: &request.source,
            checkpoints,
            start_token,
            options: &request.options,
            cancel,
        };
        state = self.transition(state, FeedState::Capturing);
        let result = self.engine.capture(ctx, sink).await;
        self.transition(state, FeedState::Closed);

        match &result {
            Ok(summary) => tracing::info!(
                "{} capture of {}.{} finished ({:?}): {} batches, {} records, {} unchanged pages",
                backend,
                request.database,
                request.source,
                summary.stop_reason,
                summary.batches_delivered,
                summary.records_delivered,
                summary.unchanged_pages
            ),
            Err(e) => tracing::error!(
                "{} capture of {}.{} failed during {}: {}",
                backend,
                request.database,
                request.source,
                e.stage(),
                e
            ),
        }
        result
    }

    async fn resolve_named_checkpoint_resource(
        &self,
        database: &L::Database,
        name: &str,
        request: &FeedRequest,
    ) -> Result<L::Resource> {
        if request.options.create_checkpoint_resource {
            return self
                .layer
                .create_resource_if_absent(database, name)
                .await
                .map_err(|e| e.for_resource(ResourceKind::CheckpointResource));
        }
        self.layer
            .resolve_resource(database, name)
            .await
            .map_err(|e| e.for_resource(ResourceKind::CheckpointResource))
    }

    fn transition(&self, from: FeedState, to: FeedState) -> FeedState {
        tracing::debug!("{:?} -> {:?}", from, to);
        to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_feed_request_builder() {
        let request = FeedRequest::new("shop", "orders")
            .with_checkpoint_resource("leases")
            .with_options(CaptureOptions {
                prefix: Some("billing-".into()),
                time_budget: Some(Duration::from_secs(30)),
                ..Default::default()
            });
        assert_eq!(request.database, "shop");
        assert_eq!(request.checkpoint_resource.as_deref(), Some("leases"));
        assert_eq!(request.options.prefix.as_deref(), Some("billing-"));
    }
}
