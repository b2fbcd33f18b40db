// ABOUTME: Runs change feed invocations once or continuously until shutdown
// ABOUTME: Poll backends repeat on an interval, subscriptions stay open until cancelled

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureEngine, CaptureMode, CaptureSummary, StopReason};
use crate::connection::ConnectionLayer;
use crate::error::{CdcError, Result, Stage};
use crate::factory::{BackendClient, CdcService};
use crate::orchestrator::{CdcOrchestrator, FeedRequest};
use crate::sink::Sink;

/// Anything that can run one capture invocation against an already connected client.
#[async_trait]
pub trait FeedProcessor: Send + Sync {
    fn capture_mode(&self) -> CaptureMode;

    async fn process(
        &self,
        request: &FeedRequest,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary>;
}

/// An orchestrator paired with the client it should use.
pub struct Connected<'a, L: ConnectionLayer, E> {
    pub orchestrator: &'a CdcOrchestrator<L, E>,
    pub client: &'a L::Client,
}

#[async_trait]
impl<L, E> FeedProcessor for Connected<'_, L, E>
where
    L: ConnectionLayer,
    E: CaptureEngine<L>,
{
    fn capture_mode(&self) -> CaptureMode {
        self.orchestrator.capture_mode()
    }

    async fn process(
        &self,
        request: &FeedRequest,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        self.orchestrator
            .process_change_feed(self.client, request, sink, cancel)
            .await
    }
}

/// A factory-built service paired with its client.
pub struct ConnectedService<'a> {
    pub service: &'a CdcService,
    pub client: &'a BackendClient,
}

#[async_trait]
impl FeedProcessor for ConnectedService<'_> {
    fn capture_mode(&self) -> CaptureMode {
        self.service.capture_mode()
    }

    async fn process(
        &self,
        request: &FeedRequest,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        self.service
            .process_change_feed(self.client, request, sink, cancel)
            .await
    }
}

/// Totals across the invocations of one `listen` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub last_stop_reason: Option<StopReason>,
    pub last_error: Option<String>,
    pub duration_ms: u64,
}

impl ListenStats {
    pub fn is_success(&self) -> bool {
        self.failed_cycles == 0
    }

    fn absorb(&mut self, summary: &CaptureSummary) {
        self.cycles += 1;
        self.batches_delivered += summary.batches_delivered;
        self.records_delivered += summary.records_delivered;
        self.last_stop_reason = Some(summary.stop_reason);
    }
}

/// Drives a [`FeedProcessor`] for one feed request.
pub struct FeedRunner<'a, P> {
    processor: &'a P,
    request: FeedRequest,
    listen_interval: Duration,
}

impl<'a, P: FeedProcessor> FeedRunner<'a, P> {
    pub fn new(processor: &'a P, request: FeedRequest, listen_interval: Duration) -> Self {
        Self {
            processor,
            request,
            listen_interval,
        }
    }

    /// One bounded invocation.
    pub async fn run_once(
        &self,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        self.processor.process(&self.request, sink, cancel).await
    }

    /// Capture until `shutdown` is cancelled.
    ///
    /// Poll backends run one invocation per interval tick; a failed cycle is logged and
    /// the next tick resumes from the last checkpoint. Setup errors end the run.
    /// Subscription backends run a single invocation with no time budget.
    pub async fn listen(
        &self,
        sink: &dyn Sink,
        shutdown: CancellationToken,
    ) -> Result<ListenStats> {
        let start = Instant::now();
        let mut stats = match self.processor.capture_mode() {
            CaptureMode::Poll => self.listen_polling(sink, &shutdown).await?,
            CaptureMode::Subscription => self.listen_subscribed(sink, shutdown).await?,
        };
        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Stopped listening on {}.{}: {} cycle(s), {} failed, {} record(s) in {}ms",
            self.request.database,
            self.request.source,
            stats.cycles,
            stats.failed_cycles,
            stats.records_delivered,
            stats.duration_ms
        );
        Ok(stats)
    }

    async fn listen_polling(
        &self,
        sink: &dyn Sink,
        shutdown: &CancellationToken,
    ) -> Result<ListenStats> {
        if self.listen_interval.is_zero() {
            return Err(CdcError::Config("listen interval must be at least 1ms".into()));
        }
        let mut ticker = interval(self.listen_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = ListenStats::default();

        tracing::info!(
            "Polling {}.{} every {:?}",
            self.request.database,
            self.request.source,
            self.listen_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping runner");
                    break;
                }
                _ = ticker.tick() => {}
            }

            tracing::debug!("Starting capture cycle {}", stats.cycles + 1);
            // The in-flight cycle observes shutdown between pages
            match self.processor.process(&self.request, sink, shutdown.clone()).await {
                Ok(summary) => stats.absorb(&summary),
                Err(e) if e.stage() == Stage::Setup => return Err(e),
                Err(e) => {
                    stats.cycles += 1;
                    stats.failed_cycles += 1;
                    tracing::error!("Capture cycle {} failed: {}", stats.cycles, e);
                    stats.last_error = Some(e.to_string());
                }
            }
        }
        Ok(stats)
    }

    async fn listen_subscribed(
        &self,
        sink: &dyn Sink,
        shutdown: CancellationToken,
    ) -> Result<ListenStats> {
        let mut request = self.request.clone();
        if request.options.time_budget.take().is_some() {
            tracing::debug!("Ignoring time budget while listening");
        }
        let summary = self.processor.process(&request, sink, shutdown).await?;
        let mut stats = ListenStats::default();
        stats.absorb(&summary);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureOptions, PollEngine, SubscriptionEngine};
    use crate::memory::MemoryBackend;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn deliver(&self, batch: &[Value]) -> anyhow::Result<()> {
            self.records.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_collection("shop", "orders");
        backend
    }

    #[test]
    fn test_listen_stats_success() {
        let mut stats = ListenStats::default();
        stats.absorb(&CaptureSummary {
            batches_delivered: 2,
            records_delivered: 4,
            ..Default::default()
        });
        assert!(stats.is_success());
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.records_delivered, 4);

        stats.failed_cycles = 1;
        assert!(!stats.is_success());
    }

    #[tokio::test]
    async fn test_run_once_delivers_pending_changes() {
        let backend = backend();
        backend.push_change("shop", "orders", json!({ "n": 1 }));
        let orchestrator = CdcOrchestrator::new(backend.clone(), PollEngine);
        let client = orchestrator.connect(&backend.connection_config()).await.unwrap();
        let processor = Connected {
            orchestrator: &orchestrator,
            client: &client,
        };
        let runner = FeedRunner::new(
            &processor,
            FeedRequest::new("shop", "orders"),
            Duration::from_secs(5),
        );
        let sink = RecordingSink::default();

        let summary = runner.run_once(&sink, CancellationToken::new()).await.unwrap();
        assert_eq!(summary.records_delivered, 1);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_listener_repeats_until_shutdown() {
        let backend = backend();
        for n in 0..3 {
            backend.push_change("shop", "orders", json!({ "n": n }));
        }
        let orchestrator = CdcOrchestrator::new(backend.clone(), PollEngine);
        let client = orchestrator.connect(&backend.connection_config()).await.unwrap();
        let processor = Connected {
            orchestrator: &orchestrator,
            client: &client,
        };
        let runner = FeedRunner::new(
            &processor,
            FeedRequest::new("shop", "orders"),
            Duration::from_secs(5),
        );
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let (stats, _) = tokio::join!(runner.listen(&sink, shutdown.clone()), async {
            tokio::time::sleep(Duration::from_secs(7)).await;
            backend.push_change("shop", "orders", json!({ "n": 3 }));
            tokio::time::sleep(Duration::from_secs(5)).await;
            shutdown.cancel();
        });

        let stats = stats.unwrap();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.failed_cycles, 0);
        assert_eq!(stats.records_delivered, 4);
        assert_eq!(sink.records.lock().unwrap().len(), 4);
        assert_eq!(
            backend.checkpoint("shop", "cdc-data-lease", "orders").as_deref(),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_polling_listener_rejects_zero_interval() {
        let backend = backend();
        let orchestrator = CdcOrchestrator::new(backend.clone(), PollEngine);
        let client = orchestrator.connect(&backend.connection_config()).await.unwrap();
        let processor = Connected {
            orchestrator: &orchestrator,
            client: &client,
        };
        let request = FeedRequest::new("shop", "orders");
        let runner = FeedRunner::new(&processor, request, Duration::ZERO);

        let err = runner
            .listen(&RecordingSink::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
        assert_eq!(backend.checkpoint_writes("shop", "cdc-data-lease"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_listener_survives_failed_cycle() {
        let backend = backend();
        let orchestrator = CdcOrchestrator::new(backend.clone(), PollEngine);
        let client = orchestrator.connect(&backend.connection_config()).await.unwrap();
        let processor = Connected {
            orchestrator: &orchestrator,
            client: &client,
        };
        let runner = FeedRunner::new(
            &processor,
            FeedRequest::new("shop", "missing"),
            Duration::from_secs(5),
        );
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let (stats, _) = tokio::join!(runner.listen(&sink, shutdown.clone()), async {
            tokio::time::sleep(Duration::from_secs(6)).await;
            shutdown.cancel();
        });

        let stats = stats.unwrap();
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.failed_cycles, 2);
        assert!(stats.last_error.unwrap().contains("'missing' does not exist"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_listener_ignores_time_budget() {
        let backend = backend();
        let orchestrator = CdcOrchestrator::new(backend.clone(), SubscriptionEngine);
        let client = orchestrator.connect(&backend.connection_config()).await.unwrap();
        let processor = Connected {
            orchestrator: &orchestrator,
            client: &client,
        };
        let request = FeedRequest::new("shop", "orders").with_options(CaptureOptions {
            time_budget: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let runner = FeedRunner::new(&processor, request, Duration::from_secs(5));
        let sink = RecordingSink::default();
        let shutdown = CancellationToken::new();

        let (stats, _) = tokio::join!(runner.listen(&sink, shutdown.clone()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            backend.push_change("shop", "orders", json!({ "n": 1 }));
            backend.push_change("shop", "orders", json!({ "n": 2 }));
            tokio::time::sleep(Duration::from_secs(3)).await;
            shutdown.cancel();
        });

        let stats = stats.unwrap();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.records_delivered, 2);
        assert_eq!(stats.last_stop_reason, Some(StopReason::ExternallyStopped));
    }
}
