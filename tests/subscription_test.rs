// ABOUTME: Integration tests for the subscription engine on the in-memory backend
// ABOUTME: Covers resume tokens, per-event checkpoints, time budgets and delivery failures

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use docdb_cdc::capture::{CaptureOptions, StopReason, SubscriptionEngine};
use docdb_cdc::memory::{MemoryBackend, MemoryClient};
use docdb_cdc::sink::Sink;
use docdb_cdc::{CdcError, CdcOrchestrator, FeedRequest};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const DB: &str = "shop";
const SOURCE: &str = "orders";
const LEASES: &str = "cdc-data-lease";

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<Value>>>,
    reject: Mutex<Option<i64>>,
}

impl RecordingSink {
    /// Reject the event whose `n` equals `n`.
    fn rejecting(n: i64) -> Self {
        Self {
            reject: Mutex::new(Some(n)),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<i64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .filter_map(|doc| doc["n"].as_i64())
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, batch: &[Value]) -> anyhow::Result<()> {
        let reject = *self.reject.lock().unwrap();
        if batch.iter().any(|doc| doc["n"].as_i64() == reject) {
            anyhow::bail!("consumer rejected event");
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

async fn setup() -> (
    MemoryBackend,
    CdcOrchestrator<MemoryBackend, SubscriptionEngine>,
    MemoryClient,
) {
    let backend = MemoryBackend::new();
    backend.create_collection(DB, SOURCE);
    let orchestrator = CdcOrchestrator::new(backend.clone(), SubscriptionEngine);
    let client = orchestrator
        .connect(&backend.connection_config())
        .await
        .unwrap();
    (backend, orchestrator, client)
}

fn budget(ms: u64) -> FeedRequest {
    FeedRequest::new(DB, SOURCE).with_options(CaptureOptions {
        time_budget: Some(Duration::from_millis(ms)),
        ..Default::default()
    })
}

#[tokio::test(start_paused = true)]
async fn test_fresh_subscription_sees_only_new_events() {
    let (backend, orchestrator, client) = setup().await;
    backend.push_change(DB, SOURCE, json!({ "n": 0 }));
    let sink = RecordingSink::default();

    let request = budget(1_000);
    let (summary, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &sink, CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.push_change(DB, SOURCE, json!({ "n": 1 }));
            backend.push_change(DB, SOURCE, json!({ "n": 2 }));
        }
    );

    let summary = summary.unwrap();
    assert_eq!(summary.stop_reason, StopReason::TimedOut);
    assert_eq!(summary.batches_delivered, 2);
    assert_eq!(sink.seen(), vec![1, 2]);
    // One single-record batch and one checkpoint per event
    assert!(sink.batches.lock().unwrap().iter().all(|b| b.len() == 1));
    assert_eq!(backend.checkpoint_writes(DB, LEASES), 2);
    assert_eq!(backend.checkpoint(DB, LEASES, SOURCE).as_deref(), Some("3"));
}

#[tokio::test(start_paused = true)]
async fn test_resumes_after_last_checkpointed_event() {
    let (backend, orchestrator, client) = setup().await;
    let first = RecordingSink::default();
    let request = budget(500);
    let (summary, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &first, CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.push_change(DB, SOURCE, json!({ "n": 1 }));
        }
    );
    summary.unwrap();

    // Changes made while nobody listened are replayed on resume
    backend.push_change(DB, SOURCE, json!({ "n": 2 }));
    backend.push_change(DB, SOURCE, json!({ "n": 3 }));

    let second = RecordingSink::default();
    let summary = orchestrator
        .process_change_feed(&client, &budget(500), &second, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.seen(), vec![2, 3]);
    assert_eq!(summary.last_token.as_deref(), Some("3"));
    assert_eq!(backend.checkpoint(DB, LEASES, SOURCE).as_deref(), Some("3"));
}

#[tokio::test(start_paused = true)]
async fn test_idle_subscription_leaves_checkpoint_untouched() {
    let (backend, orchestrator, client) = setup().await;
    let sink = RecordingSink::default();

    let summary = orchestrator
        .process_change_feed(&client, &budget(200), &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::TimedOut);
    assert!(sink.seen().is_empty());
    assert_eq!(backend.checkpoint_writes(DB, LEASES), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_stops_before_later_events() {
    let (backend, orchestrator, client) = setup().await;
    let sink = RecordingSink::rejecting(2);

    let request = budget(1_000);
    let (result, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &sink, CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            for n in 1..=3 {
                backend.push_change(DB, SOURCE, json!({ "n": n }));
            }
        }
    );

    let err = result.unwrap_err();
    assert!(matches!(err, CdcError::Delivery { records: 1, .. }));
    assert_eq!(sink.seen(), vec![1]);
    // Checkpoint stays at event 1 so event 2 is redelivered next time
    assert_eq!(backend.checkpoint(DB, LEASES, SOURCE).as_deref(), Some("1"));
}

#[tokio::test(start_paused = true)]
async fn test_external_stop_closes_subscription() {
    let (backend, orchestrator, client) = setup().await;
    let sink = RecordingSink::default();
    let cancel = CancellationToken::new();

    let request = FeedRequest::new(DB, SOURCE);
    let (summary, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &sink, cancel.clone()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.push_change(DB, SOURCE, json!({ "n": 1 }));
            tokio::time::sleep(Duration::from_secs(60)).await;
            cancel.cancel();
        }
    );

    let summary = summary.unwrap();
    assert_eq!(summary.stop_reason, StopReason::ExternallyStopped);
    assert_eq!(sink.seen(), vec![1]);
}

#[tokio::test]
async fn test_closed_stream_ends_capture() {
    let (backend, orchestrator, client) = setup().await;
    let sink = RecordingSink::default();

    let request = FeedRequest::new(DB, SOURCE);
    let (summary, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &sink, CancellationToken::new()),
        async {
            tokio::task::yield_now().await;
            backend.push_change(DB, SOURCE, json!({ "n": 1 }));
            backend.close_subscriptions(DB, SOURCE);
        }
    );

    let summary = summary.unwrap();
    assert_eq!(summary.stop_reason, StopReason::Drained);
    assert_eq!(summary.records_delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_resume_token_starts_from_now() {
    let (backend, orchestrator, client) = setup().await;
    backend.push_change(DB, SOURCE, json!({ "n": 0 }));
    backend.create_collection(DB, LEASES);
    backend.put_raw_checkpoint(DB, LEASES, SOURCE, json!({ "id": SOURCE, "lease": "garbage" }));
    let sink = RecordingSink::default();

    let request = budget(500);
    let (summary, _) = tokio::join!(
        orchestrator.process_change_feed(&client, &request, &sink, CancellationToken::new()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.push_change(DB, SOURCE, json!({ "n": 1 }));
        }
    );

    summary.unwrap();
    assert_eq!(sink.seen(), vec![1]);
    assert_eq!(backend.checkpoint(DB, LEASES, SOURCE).as_deref(), Some("2"));
}
