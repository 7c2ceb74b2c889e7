//! Job runtime harness.
//!
//! Wires configuration, a broker client, the subscription policy and a
//! [`Runner`] together and blocks until the run context is cancelled. The
//! broker client is owned by the harness and closed on every exit path.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info, info_span, warn};

use hanko_jobs_broker::{
    Broker, BrokerConnector, BrokerError, DeadLetterTarget, ReceiveSettings, Subscription,
    SubscriptionConfig, SubscriptionConfigUpdate,
};
use hanko_jobs_core::{MetricsRecorder, Processor, SubscriptionPolicy};

use crate::workers::runner::{DEFAULT_WORKER_NAME, Runner, RunnerError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("jobs runtime: project id is required")]
    MissingProjectId,

    #[error("jobs runtime: subscription id is required")]
    MissingSubscriptionId,

    #[error("jobs runtime: processor is required")]
    MissingProcessor,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("jobs runtime: failed to create broker client: {0}")]
    Connect(#[source] BrokerError),

    #[error("jobs runtime: subscription lookup failed: {0}")]
    Lookup(#[source] BrokerError),

    #[error("jobs runtime: subscription {0:?} not found")]
    SubscriptionNotFound(String),

    #[error("jobs runtime: failed to apply subscription policy: {0}")]
    Policy(#[source] BrokerError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Options for [`run`].
#[derive(Clone, Default)]
pub struct RuntimeOptions {
    pub project_id: String,
    pub subscription_id: String,
    /// Defaults to `worker` when blank.
    pub worker_name: String,
    pub processor: Option<Arc<dyn Processor>>,
    /// Parent span for all runtime logs.
    pub span: Option<Span>,
    /// Defaults to the OpenTelemetry recorder.
    pub metrics: Option<Arc<dyn MetricsRecorder>>,
    pub receive_settings: Option<ReceiveSettings>,
    pub skip_subscription_validation: bool,
    pub subscription_policy: Option<SubscriptionPolicy>,
    /// Log and continue when the policy cannot be applied.
    pub policy_advisory: bool,
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("project_id", &self.project_id)
            .field("subscription_id", &self.subscription_id)
            .field("worker_name", &self.worker_name)
            .field("processor", &self.processor.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("receive_settings", &self.receive_settings)
            .field("skip_subscription_validation", &self.skip_subscription_validation)
            .field("subscription_policy", &self.subscription_policy)
            .field("policy_advisory", &self.policy_advisory)
            .finish()
    }
}

impl RuntimeOptions {
    fn validate(&self) -> Result<Arc<dyn Processor>, ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::MissingProjectId);
        }
        if self.subscription_id.trim().is_empty() {
            return Err(ConfigError::MissingSubscriptionId);
        }
        self.processor.clone().ok_or(ConfigError::MissingProcessor)
    }
}

/// Run a worker until `cancel` fires or a fatal error occurs.
///
/// Cancellation is a clean shutdown and returns `Ok(())`.
pub async fn run(
    cancel: CancellationToken,
    mut options: RuntimeOptions,
    connector: &dyn BrokerConnector,
) -> Result<(), RuntimeError> {
    if options.worker_name.trim().is_empty() {
        options.worker_name = DEFAULT_WORKER_NAME.to_string();
    }
    let processor = options.validate()?;

    let span = match &options.span {
        Some(parent) => info_span!(parent: parent, "jobs_runtime", worker = %options.worker_name),
        None => info_span!("jobs_runtime", worker = %options.worker_name),
    };

    async move {
        let broker = connector
            .connect(options.project_id.trim())
            .await
            .map_err(RuntimeError::Connect)?;

        let served = AssertUnwindSafe(serve(&cancel, &options, processor, broker.as_ref()))
            .catch_unwind()
            .await;

        if let Err(err) = broker.close().await {
            warn!(error = %err, "jobs runtime failed to close broker client");
        }

        match served {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    .instrument(span)
    .await
}

async fn serve(
    cancel: &CancellationToken,
    options: &RuntimeOptions,
    processor: Arc<dyn Processor>,
    broker: &dyn Broker,
) -> Result<(), RuntimeError> {
    let subscription = broker.subscription(options.subscription_id.trim());

    if !options.skip_subscription_validation {
        let exists = subscription.exists().await.map_err(RuntimeError::Lookup)?;
        if !exists {
            return Err(RuntimeError::SubscriptionNotFound(
                options.subscription_id.clone(),
            ));
        }
    }

    if let Some(policy) = &options.subscription_policy {
        let applied =
            apply_subscription_policy(options.project_id.trim(), subscription.as_ref(), policy)
                .await;
        match applied {
            Ok(_) => {}
            Err(err) if options.policy_advisory => {
                warn!(
                    subscription = %subscription.name(),
                    error = %err,
                    "jobs runtime continuing without subscription policy"
                );
            }
            Err(err) => return Err(err),
        }
    }

    let mut runner = Runner::new(subscription, processor)
        .with_name(&options.worker_name)
        .with_span(Span::current());
    if let Some(metrics) = &options.metrics {
        runner = runner.with_metrics(metrics.clone());
    }
    if let Some(settings) = options.receive_settings {
        runner = runner.with_receive_settings(settings);
    }

    runner.run(cancel.clone()).await?;
    Ok(())
}

/// Translate `policy` into a subscription update for `project_id`.
///
/// Empty sub-policies are skipped, as is a dead-letter policy that names no
/// topic.
pub fn policy_update(project_id: &str, policy: &SubscriptionPolicy) -> SubscriptionConfigUpdate {
    let retry_policy = policy.retry.filter(|retry| !retry.is_empty());

    let dead_letter_policy = policy
        .dead_letter
        .as_ref()
        .filter(|dead_letter| !dead_letter.is_empty())
        .and_then(|dead_letter| {
            dead_letter
                .resolve_topic(project_id)
                .map(|topic| DeadLetterTarget {
                    topic,
                    max_delivery_attempts: dead_letter.max_delivery_attempts,
                })
        });

    SubscriptionConfigUpdate {
        retry_policy,
        dead_letter_policy,
    }
}

/// Apply `policy` to `subscription` in a single update.
///
/// Returns the resulting configuration, or `None` when the policy carries
/// nothing to apply.
pub async fn apply_subscription_policy(
    project_id: &str,
    subscription: &dyn Subscription,
    policy: &SubscriptionPolicy,
) -> Result<Option<SubscriptionConfig>, RuntimeError> {
    let update = policy_update(project_id, policy);
    if update.is_empty() {
        return Ok(None);
    }

    let retry_configured = update.retry_policy.is_some();
    let dead_letter_configured = update.dead_letter_policy.is_some();
    let config = subscription
        .update(update)
        .await
        .map_err(RuntimeError::Policy)?;

    info!(
        subscription = %subscription.name(),
        retry_configured,
        dead_letter_configured,
        "jobs runtime applied subscription policy"
    );
    Ok(Some(config))
}
