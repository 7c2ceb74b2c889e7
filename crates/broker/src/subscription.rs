//! Broker contract: subscriptions, deliveries and configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hanko_jobs_core::RetryPolicy;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

/// Backoff applied when a retry policy leaves the minimum unset.
pub const DEFAULT_MINIMUM_BACKOFF: Duration = Duration::from_secs(10);
/// Backoff applied when a retry policy leaves the maximum unset.
pub const DEFAULT_MAXIMUM_BACKOFF: Duration = Duration::from_secs(600);

/// Settles deliveries on behalf of a [`ReceivedMessage`].
///
/// Settlement is fire-and-forget: implementations log failures instead of
/// returning them, and an unsettled message is redelivered by the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, ack_id: &str);
    async fn nack(&self, ack_id: &str);
}

/// A single delivery of a broker message.
///
/// Consumed by [`ReceivedMessage::ack`] or [`ReceivedMessage::nack`], so a
/// delivery can be settled at most once.
pub struct ReceivedMessage {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: DateTime<Utc>,
    /// Delivery counter when the broker tracks one.
    pub delivery_attempt: Option<u32>,
    pub ordering_key: Option<String>,
    ack_id: String,
    acker: Arc<dyn Acknowledger>,
}

impl ReceivedMessage {
    pub fn new(
        id: impl Into<String>,
        data: Vec<u8>,
        ack_id: impl Into<String>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id: id.into(),
            data,
            attributes: HashMap::new(),
            publish_time: Utc::now(),
            delivery_attempt: None,
            ordering_key: None,
            ack_id: ack_id.into(),
            acker,
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub async fn ack(self) {
        self.acker.ack(&self.ack_id).await;
    }

    pub async fn nack(self) {
        self.acker.nack(&self.ack_id).await;
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("data_len", &self.data.len())
            .field("attributes", &self.attributes)
            .field("publish_time", &self.publish_time)
            .field("delivery_attempt", &self.delivery_attempt)
            .field("ordering_key", &self.ordering_key)
            .field("ack_id", &self.ack_id)
            .finish()
    }
}

/// Callback invoked once per delivery, concurrently across deliveries.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: CancellationToken, message: ReceivedMessage);
}

/// Flow control for a receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Upper bound on deliveries handed to the handler and not yet settled.
    pub max_outstanding_messages: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1000,
        }
    }
}

/// Dead-letter forwarding configured on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// Fully qualified topic resource.
    pub topic: String,
    pub max_delivery_attempts: u32,
}

/// Current configuration of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Fully qualified topic the subscription is attached to.
    pub topic: String,
    pub retry_policy: Option<RetryPolicy>,
    pub dead_letter_policy: Option<DeadLetterTarget>,
}

/// Partial configuration update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionConfigUpdate {
    pub retry_policy: Option<RetryPolicy>,
    pub dead_letter_policy: Option<DeadLetterTarget>,
}

impl SubscriptionConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.retry_policy.is_none() && self.dead_letter_policy.is_none()
    }

    /// Apply the update to `config`.
    pub fn apply_to(&self, config: &mut SubscriptionConfig) {
        if let Some(retry) = self.retry_policy {
            config.retry_policy = Some(retry);
        }
        if let Some(dead_letter) = &self.dead_letter_policy {
            config.dead_letter_policy = Some(dead_letter.clone());
        }
    }
}

/// Delay before redelivering a message nacked on its `attempt`-th delivery.
///
/// Without a retry policy the broker redelivers immediately. Otherwise the
/// delay doubles per attempt from the minimum and is capped at the maximum;
/// unset bounds fall back to [`DEFAULT_MINIMUM_BACKOFF`] and
/// [`DEFAULT_MAXIMUM_BACKOFF`].
pub fn redelivery_backoff(policy: Option<&RetryPolicy>, attempt: u32) -> Duration {
    let Some(policy) = policy else {
        return Duration::ZERO;
    };
    let min = if policy.minimum_backoff.is_zero() {
        DEFAULT_MINIMUM_BACKOFF
    } else {
        policy.minimum_backoff
    };
    let max = if policy.maximum_backoff.is_zero() {
        DEFAULT_MAXIMUM_BACKOFF
    } else {
        policy.maximum_backoff
    }
    .max(min);

    let exponent = attempt.saturating_sub(1).min(31);
    min.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// Handle to a named subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Short subscription identifier.
    fn id(&self) -> &str;

    /// Fully qualified subscription resource.
    fn name(&self) -> &str;

    async fn exists(&self) -> Result<bool, BrokerError>;

    async fn config(&self) -> Result<SubscriptionConfig, BrokerError>;

    /// Apply `update` atomically and return the resulting configuration.
    async fn update(
        &self,
        update: SubscriptionConfigUpdate,
    ) -> Result<SubscriptionConfig, BrokerError>;

    /// Deliver messages to `handler` until `cancel` fires.
    ///
    /// Returns `Ok(())` after cancellation once every in-flight handler has
    /// finished. Any other exit is an unrecoverable receive error.
    async fn receive(
        &self,
        cancel: CancellationToken,
        settings: ReceiveSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError>;
}

/// A connected broker client scoped to one project.
#[async_trait]
pub trait Broker: Send + Sync {
    fn project_id(&self) -> &str;

    /// Resolve a subscription handle; existence is not checked.
    fn subscription(&self, id: &str) -> Arc<dyn Subscription>;

    /// Release the client. Receive loops on this client stop with
    /// [`BrokerError::Closed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Factory for broker clients.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn Broker>, BrokerError>;
}

#[async_trait]
impl<C> BrokerConnector for Arc<C>
where
    C: BrokerConnector + ?Sized,
{
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        (**self).connect(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min: u64, max: u64) -> RetryPolicy {
        RetryPolicy {
            minimum_backoff: Duration::from_secs(min),
            maximum_backoff: Duration::from_secs(max),
        }
    }

    #[test]
    fn backoff_without_policy_is_immediate() {
        assert_eq!(redelivery_backoff(None, 5), Duration::ZERO);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10, 120);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| redelivery_backoff(Some(&p), attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 120, 120]);
        assert_eq!(redelivery_backoff(Some(&p), 200).as_secs(), 120);
    }

    #[test]
    fn backoff_fills_unset_bounds() {
        let p = policy(0, 0);
        assert_eq!(redelivery_backoff(Some(&p), 1), DEFAULT_MINIMUM_BACKOFF);
        assert_eq!(redelivery_backoff(Some(&p), 30), DEFAULT_MAXIMUM_BACKOFF);
    }

    #[test]
    fn update_leaves_unset_fields() {
        let mut config = SubscriptionConfig {
            topic: "projects/p/topics/ai-jobs".to_string(),
            retry_policy: Some(policy(1, 2)),
            dead_letter_policy: None,
        };
        SubscriptionConfigUpdate {
            retry_policy: None,
            dead_letter_policy: Some(DeadLetterTarget {
                topic: "projects/p/topics/ai-jobs-dlq".to_string(),
                max_delivery_attempts: 5,
            }),
        }
        .apply_to(&mut config);

        assert_eq!(config.retry_policy, Some(policy(1, 2)));
        assert_eq!(
            config.dead_letter_policy.map(|d| d.max_delivery_attempts),
            Some(5)
        );
    }
}
