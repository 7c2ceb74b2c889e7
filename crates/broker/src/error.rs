#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("subscription {0:?} not found")]
    SubscriptionNotFound(String),

    #[error("subscription {0:?} already exists")]
    SubscriptionExists(String),

    #[error("topic {0:?} not found")]
    TopicNotFound(String),

    #[error("invalid subscription configuration: {0}")]
    InvalidConfig(String),

    #[error("broker client closed")]
    Closed,
}
