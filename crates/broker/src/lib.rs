//! Message broker abstraction (mechanics only).
//!
//! The runtime binds to a broker through the traits in [`subscription`]:
//! a [`Broker`] hands out [`Subscription`] handles, a subscription delivers
//! [`ReceivedMessage`]s to a [`MessageHandler`], and every delivery is settled
//! exactly once with `ack()` or `nack()`.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a nacked (or never settled) message is redelivered.
//! - **Broker-side scheduling**: redelivery backoff and dead-lettering are
//!   subscription configuration, never runner logic.
//! - **Delivery attempts**: a broker may report how many times a message was
//!   delivered; the count is optional.
//!
//! [`InMemoryBroker`] is an emulator for tests and local development.
//! Infrastructure-backed brokers live in `hanko-jobs-infra`.

pub mod error;
pub mod in_memory;
pub mod subscription;

pub use error::BrokerError;
pub use in_memory::{InMemoryBroker, PublishMessage, StoredMessage, SubscriptionStats};
pub use subscription::{
    Acknowledger, Broker, BrokerConnector, DeadLetterTarget, MessageHandler, ReceiveSettings,
    ReceivedMessage, Subscription, SubscriptionConfig, SubscriptionConfigUpdate,
    redelivery_backoff,
};

/// Attribute stamped on dead-lettered messages: source subscription.
pub const DEAD_LETTER_SOURCE_SUBSCRIPTION: &str = "deadLetterSourceSubscription";
/// Attribute stamped on dead-lettered messages: delivery attempts consumed.
pub const DEAD_LETTER_DELIVERY_ATTEMPTS: &str = "deadLetterDeliveryAttempts";

/// Fully qualified topic resource for `topic` within `project_id`.
/// Already qualified names are returned unchanged.
pub fn topic_name(project_id: &str, topic: &str) -> String {
    qualify(project_id, "topics", topic)
}

/// Fully qualified subscription resource for `subscription` within `project_id`.
pub fn subscription_name(project_id: &str, subscription: &str) -> String {
    qualify(project_id, "subscriptions", subscription)
}

fn qualify(project_id: &str, collection: &str, id: &str) -> String {
    let id = id.trim();
    if id.starts_with(hanko_jobs_core::TOPIC_RESOURCE_PREFIX) {
        id.to_string()
    } else {
        format!("projects/{project_id}/{collection}/{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_qualified_once() {
        assert_eq!(topic_name("p", "ai-jobs"), "projects/p/topics/ai-jobs");
        assert_eq!(
            topic_name("p", "projects/q/topics/ai-jobs"),
            "projects/q/topics/ai-jobs"
        );
        assert_eq!(
            subscription_name("p", " ai-worker-sub "),
            "projects/p/subscriptions/ai-worker-sub"
        );
    }
}
