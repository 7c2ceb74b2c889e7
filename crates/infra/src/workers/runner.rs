//! Subscription runner: receive, dispatch, settle, record.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use hanko_jobs_broker::{
    BrokerError, MessageHandler, ReceiveSettings, ReceivedMessage, Subscription,
};
use hanko_jobs_core::{
    ErrorKind, Message, MetricsRecorder, Outcome, Processor, Reply, sanitize_label, settle,
};
use hanko_jobs_observability::OtelMetrics;

pub const DEFAULT_WORKER_NAME: &str = "worker";

/// Lifecycle of a [`Runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Constructed,
    Running,
    /// Cancellation observed; waiting for in-flight dispatches.
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("jobs runner: receive failed: {0}")]
    Receive(#[from] BrokerError),
}

/// Consumes one subscription and hands every delivery to a [`Processor`].
///
/// - Messages are copied out of the delivery before dispatch
/// - Processor panics are caught per dispatch and nacked
/// - Every delivery is acked or nacked exactly once and recorded exactly once
///
/// A runner is single-use: [`Runner::run`] consumes it. Runners hold no
/// process-wide state, so several can service disjoint subscriptions in the
/// same process.
pub struct Runner {
    name: String,
    subscription: Arc<dyn Subscription>,
    processor: Arc<dyn Processor>,
    span: Span,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    receive_settings: Option<ReceiveSettings>,
    state: watch::Sender<RunnerState>,
}

impl Runner {
    pub fn new(subscription: Arc<dyn Subscription>, processor: Arc<dyn Processor>) -> Self {
        let (state, _) = watch::channel(RunnerState::Constructed);
        Self {
            name: DEFAULT_WORKER_NAME.to_string(),
            subscription,
            processor,
            span: Span::none(),
            metrics: None,
            receive_settings: None,
            state,
        }
    }

    /// Logical worker name used in logs and metrics. Blank names keep the
    /// current one.
    pub fn with_name(mut self, name: &str) -> Self {
        if !name.trim().is_empty() {
            self.name = sanitize_label(name);
        }
        self
    }

    /// Parent span for every log line emitted by the runner.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Metrics recorder; defaults to [`OtelMetrics`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receive settings applied before the receive loop starts.
    pub fn with_receive_settings(mut self, settings: ReceiveSettings) -> Self {
        self.receive_settings = Some(settings);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Receive until `cancel` fires or the subscription fails.
    ///
    /// Cancellation is a normal shutdown: in-flight dispatches observe the
    /// same token, their messages are nacked, and `run` returns `Ok` once they
    /// have finished.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunnerError> {
        let span = self.span.clone();
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> Result<(), RunnerError> {
        let subscription = self.subscription.name().to_string();
        let worker = self.name.clone();
        info!(subscription = %subscription, worker = %worker, "jobs runner starting");

        let metrics = self
            .metrics
            .clone()
            .unwrap_or_else(|| Arc::new(OtelMetrics::new()));
        let dispatcher: Arc<dyn MessageHandler> = Arc::new(Dispatcher {
            name: self.name.clone(),
            subscription: subscription.clone(),
            processor: self.processor.clone(),
            metrics,
            span: Span::current(),
        });
        let settings = self.receive_settings.unwrap_or_default();

        self.state.send_replace(RunnerState::Running);
        let receive = self
            .subscription
            .receive(cancel.clone(), settings, dispatcher);
        tokio::pin!(receive);

        let result = tokio::select! {
            result = &mut receive => result,
            _ = cancel.cancelled() => {
                self.state.send_replace(RunnerState::Draining);
                receive.await
            }
        };
        self.state.send_replace(RunnerState::Stopped);

        match result {
            Ok(()) => {
                info!(subscription = %subscription, worker = %worker, "jobs runner stopped");
                Ok(())
            }
            Err(err) => {
                error!(
                    subscription = %subscription,
                    worker = %worker,
                    error = %err,
                    "jobs runner stopped with error"
                );
                Err(err.into())
            }
        }
    }
}

/// Copy a delivery into a [`Message`]; a missing delivery attempt reads as 0.
pub fn normalize_message(subscription: &str, delivery: &ReceivedMessage) -> Message {
    Message {
        id: delivery.id.clone(),
        data: delivery.data.clone(),
        attributes: delivery.attributes.clone(),
        publish_time: delivery.publish_time,
        delivery_attempt: delivery.delivery_attempt.unwrap_or(0),
        ordering_key: delivery.ordering_key.clone(),
        subscription_name: subscription.to_string(),
    }
}

struct Dispatcher {
    name: String,
    subscription: String,
    processor: Arc<dyn Processor>,
    metrics: Arc<dyn MetricsRecorder>,
    span: Span,
}

impl Dispatcher {
    async fn dispatch(&self, ctx: CancellationToken, delivery: ReceivedMessage) {
        let started = Instant::now();
        let message = normalize_message(&self.subscription, &delivery);
        let message_id = message.id.clone();
        let attempt = message.delivery_attempt;

        if ctx.is_cancelled() {
            delivery.nack().await;
            warn!(
                worker = %self.name,
                message_id = %message_id,
                delivery_attempt = attempt,
                subscription = %self.subscription,
                "jobs message returned unprocessed after cancellation"
            );
            self.metrics
                .record(&self.name, Outcome::Retry, attempt, started.elapsed());
            return;
        }

        let result = match AssertUnwindSafe(self.processor.process(&ctx, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ErrorKind::classify(err)),
            Err(payload) => Err(ErrorKind::from_panic(payload)),
        };

        let (reply, outcome) = settle(&result);
        match reply {
            Reply::Ack => delivery.ack().await,
            Reply::Nack => delivery.nack().await,
        }
        self.log(&message_id, attempt, &result);
        self.metrics
            .record(&self.name, outcome, attempt, started.elapsed());
    }

    fn log(&self, message_id: &str, attempt: u32, result: &Result<(), ErrorKind>) {
        let worker = &self.name;
        let subscription = &self.subscription;
        match result {
            Ok(()) => debug!(
                worker = %worker,
                message_id,
                delivery_attempt = attempt,
                subscription = %subscription,
                "jobs message processed"
            ),
            Err(ErrorKind::Cancellation(err)) => warn!(
                worker = %worker,
                message_id,
                delivery_attempt = attempt,
                subscription = %subscription,
                error = %format!("{err:#}"),
                "jobs processor cancelled"
            ),
            Err(ErrorKind::Transient(err)) => warn!(
                worker = %worker,
                message_id,
                delivery_attempt = attempt,
                subscription = %subscription,
                error = %format!("{err:#}"),
                "jobs processor transient failure"
            ),
            Err(ErrorKind::Permanent(err)) => error!(
                worker = %worker,
                message_id,
                delivery_attempt = attempt,
                subscription = %subscription,
                error = %format!("{err:#}"),
                "jobs processor permanent failure"
            ),
            Err(ErrorKind::Panic(value)) => error!(
                worker = %worker,
                message_id,
                delivery_attempt = attempt,
                subscription = %subscription,
                panic = %value,
                "jobs processor panic recovered"
            ),
        }
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, ctx: CancellationToken, delivery: ReceivedMessage) {
        let span = self.span.clone();
        self.dispatch(ctx, delivery).instrument(span).await
    }
}
