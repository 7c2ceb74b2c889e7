//! Dead-letter capture.
//!
//! Messages that exhausted their delivery attempts arrive on a dead-letter
//! subscription. The processor turns each one into a [`DeadLetterEvent`] and
//! forwards it to a [`DeadLetterSink`]; sink failures are always retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use hanko_jobs_core::{Message, MetricsRecorder, Outcome, Processor};
use hanko_jobs_observability::OtelMetrics;

pub const DEAD_LETTER_WORKER_NAME: &str = "deadletter";

/// Summary of a message routed to a dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    pub message_id: String,
    pub subscription_name: String,
    pub attributes: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub delivery_attempt: u32,
    pub publish_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    /// Build an event from `message`, stamped with the current time.
    pub fn capture(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            subscription_name: message.subscription_name.clone(),
            attributes: message.attributes.clone(),
            payload: message.data.clone(),
            delivery_attempt: message.delivery_attempt,
            publish_time: message.publish_time,
            received_at: Utc::now(),
        }
    }
}

/// Destination for captured dead-letter events (alerting, audit store, ...).
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn report_dead_letter(
        &self,
        ctx: &CancellationToken,
        event: DeadLetterEvent,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    async fn report_dead_letter(
        &self,
        ctx: &CancellationToken,
        event: DeadLetterEvent,
    ) -> anyhow::Result<()> {
        (**self).report_dead_letter(ctx, event).await
    }
}

/// Processor for dead-letter subscriptions. Without a sink it only logs.
pub struct DeadLetterProcessor {
    sink: Option<Arc<dyn DeadLetterSink>>,
    metrics: Arc<dyn MetricsRecorder>,
    name: String,
}

impl DeadLetterProcessor {
    pub fn new(
        sink: Option<Arc<dyn DeadLetterSink>>,
        metrics: Option<Arc<dyn MetricsRecorder>>,
    ) -> Self {
        Self {
            sink,
            metrics: metrics.unwrap_or_else(|| Arc::new(OtelMetrics::new())),
            name: DEAD_LETTER_WORKER_NAME.to_string(),
        }
    }
}

#[async_trait]
impl Processor for DeadLetterProcessor {
    async fn process(&self, ctx: &CancellationToken, message: Message) -> anyhow::Result<()> {
        let event = DeadLetterEvent::capture(&message);
        let attempt = message.delivery_attempt;

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.report_dead_letter(ctx, event).await {
                self.metrics
                    .record(&self.name, Outcome::DeadLetterRetry, attempt, Duration::ZERO);
                error!(
                    message_id = %message.id,
                    delivery_attempt = attempt,
                    error = %format!("{err:#}"),
                    "deadletter processor: sink failed"
                );
                return Err(err);
            }
        }

        self.metrics
            .record(&self.name, Outcome::DeadLetter, attempt, Duration::ZERO);
        error!(
            message_id = %message.id,
            delivery_attempt = attempt,
            subscription = %message.subscription_name,
            "deadletter processor: message captured"
        );
        Ok(())
    }
}
