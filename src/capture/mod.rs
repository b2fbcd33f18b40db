// ABOUTME: Capture engine contract and the options/summary shared by both engines
// ABOUTME: Poll engine drives paged feeds, subscription engine drives change streams

pub mod poll;
pub mod subscription;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::connection::ConnectionLayer;
use crate::error::Result;
use crate::sink::Sink;

pub use poll::{ChangeFeed, ChangeFeedSource, FeedPage, FeedStart, PollEngine};
pub use subscription::{ChangeEvent, ChangeSubscriber, SubscriptionEngine};

/// Per-invocation capture settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Namespaces the checkpoint id so several consumers can read one source.
    pub prefix: Option<String>,
    /// Advisory wall-clock budget, checked between pages or events.
    pub time_budget: Option<Duration>,
    /// Items per page for the poll backend.
    pub page_size: Option<u32>,
    /// Create a named checkpoint resource instead of failing when it is missing.
    pub create_checkpoint_resource: bool,
}

impl CaptureOptions {
    /// Page size with the default of one applied.
    pub fn effective_page_size(&self) -> u32 {
        match self.page_size {
            Some(size) if size > 0 => size,
            _ => 1,
        }
    }

    /// A zero budget counts as no budget.
    pub fn effective_time_budget(&self) -> Option<Duration> {
        self.time_budget.filter(|budget| !budget.is_zero())
    }
}

/// How an engine reaches the backend, which decides how a long-lived runner repeats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Bounded pulls from a paged feed; repeated on an interval.
    Poll,
    /// One open-ended subscription held until stopped.
    Subscription,
}

/// Why a capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    /// The backend had nothing more to offer.
    #[default]
    Drained,
    TimedOut,
    ExternallyStopped,
}

/// Counters for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub checkpoints_written: u64,
    pub unchanged_pages: u64,
    pub last_token: Option<String>,
    pub stop_reason: StopReason,
}

impl CaptureSummary {
    pub(crate) fn record_delivery(&mut self, records: usize, token: &str) {
        self.batches_delivered += 1;
        self.records_delivered += records as u64;
        self.checkpoints_written += 1;
        self.last_token = Some(token.to_string());
    }
}

/// Cooperative stop check: the caller's cancellation token and an optional deadline.
#[derive(Debug, Clone)]
pub struct StopCondition {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl StopCondition {
    pub fn new(cancel: CancellationToken, budget: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: budget.map(|b| Instant::now() + b),
        }
    }

    /// `Some` once the loop must stop. External cancellation wins over the deadline.
    pub fn check(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::ExternallyStopped);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    /// Resolves when either stop condition fires.
    pub async fn wait(&self) -> StopReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => StopReason::ExternallyStopped,
                    _ = tokio::time::sleep_until(deadline) => StopReason::TimedOut,
                }
            }
            None => {
                self.cancel.cancelled().await;
                StopReason::ExternallyStopped
            }
        }
    }
}

/// Everything an engine needs from the orchestrator for one invocation.
pub struct CaptureContext<'a, L: ConnectionLayer> {
    pub layer: &'a L,
    pub source: &'a L::Resource,
    pub source_name: &'a str,
    pub checkpoints: CheckpointStore<'a, L>,
    /// Token read from the checkpoint store before capture started.
    pub start_token: Option<String>,
    pub options: &'a CaptureOptions,
    pub cancel: CancellationToken,
}

/// Drives a backend's native change primitive, delivering batches to the sink and
/// advancing the checkpoint only after each successful delivery.
#[async_trait]
pub trait CaptureEngine<L: ConnectionLayer>: Send + Sync {
    fn mode(&self) -> CaptureMode;

    async fn capture(&self, ctx: CaptureContext<'_, L>, sink: &dyn Sink) -> Result<CaptureSummary>;
}
