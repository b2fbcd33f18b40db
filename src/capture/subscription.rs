// ABOUTME: Subscription capture engine for push-based change streams
// ABOUTME: Delivers each event as a one-record batch and checkpoints its resume token

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use super::{CaptureContext, CaptureEngine, CaptureMode, CaptureSummary, StopCondition, StopReason};
use crate::connection::ConnectionLayer;
use crate::error::{CdcError, Result};
use crate::sink::Sink;

/// One change observed by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub document: Value,
    /// Serialized native position marker of this event.
    pub resume_token: String,
}

/// Open subscription. Dropping it closes the subscription.
pub type ChangeSubscription = BoxStream<'static, Result<ChangeEvent>>;

/// Backends exposing a push-based change subscription.
#[async_trait]
pub trait ChangeSubscriber: ConnectionLayer {
    /// Subscribe after `resume_token`, or from the current position when the token is
    /// absent or cannot be turned into a native resume position.
    async fn subscribe(
        &self,
        source: &Self::Resource,
        resume_token: Option<&str>,
    ) -> Result<ChangeSubscription>;
}

/// Listener over a [`ChangeSubscriber`].
///
/// Events are handled strictly in arrival order; a slow sink holds back later events
/// without dropping them. The first failed delivery closes the subscription and is
/// returned, so no later event can move the checkpoint past it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionEngine;

#[async_trait]
impl<L> CaptureEngine<L> for SubscriptionEngine
where
    L: ChangeSubscriber,
{
    fn mode(&self) -> CaptureMode {
        CaptureMode::Subscription
    }

    async fn capture(&self, ctx: CaptureContext<'_, L>, sink: &dyn Sink) -> Result<CaptureSummary> {
        let mut subscription = ctx
            .layer
            .subscribe(ctx.source, ctx.start_token.as_deref())
            .await?;
        let stop = StopCondition::new(ctx.cancel.clone(), ctx.options.effective_time_budget());

        tracing::info!(
            "Subscribed to changes of '{}' ({})",
            ctx.source_name,
            if ctx.start_token.is_some() {
                "resuming"
            } else {
                "from current position"
            }
        );

        let mut summary = CaptureSummary::default();
        loop {
            // Stop is only observed while waiting for the next event, never mid-delivery
            let next = tokio::select! {
                biased;
                reason = stop.wait() => {
                    summary.stop_reason = reason;
                    break;
                }
                next = subscription.next() => next,
            };

            let event = match next {
                Some(event) => event?,
                None => {
                    summary.stop_reason = StopReason::Drained;
                    break;
                }
            };

            let batch = vec![event.document];
            sink.deliver(&batch)
                .await
                .map_err(|source| CdcError::Delivery { records: 1, source })?;
            ctx.checkpoints.advance(&event.resume_token).await?;
            summary.record_delivery(1, &event.resume_token);
        }

        drop(subscription);
        tracing::info!(
            "Closed subscription on '{}' after {} event(s) ({:?})",
            ctx.source_name,
            summary.batches_delivered,
            summary.stop_reason
        );
        Ok(summary)
    }
}
