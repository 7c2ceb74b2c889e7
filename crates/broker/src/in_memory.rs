//! In-memory broker emulator for tests/dev.
//!
//! - Topics fan out to every attached subscription
//! - Delivery attempts are always reported
//! - Nacks are redelivered after the subscription's retry backoff
//! - Messages are forwarded to the dead-letter topic once their delivery
//!   attempts reach `max_delivery_attempts`
//! - Messages sharing an ordering key are delivered one at a time, in publish
//!   order; a nacked message is redelivered before later ones with its key
//!
//! Every client obtained through [`BrokerConnector::connect`] shares the same
//! state, so a test can keep its own handle to publish and inspect while the
//! runtime owns (and closes) another.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::BrokerError;
use crate::subscription::{
    Acknowledger, Broker, BrokerConnector, MessageHandler, ReceiveSettings, ReceivedMessage,
    Subscription, SubscriptionConfig, SubscriptionConfigUpdate, redelivery_backoff,
};
use crate::{
    DEAD_LETTER_DELIVERY_ATTEMPTS, DEAD_LETTER_SOURCE_SUBSCRIPTION, subscription_name, topic_name,
};

/// Message as published to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: DateTime<Utc>,
    pub ordering_key: Option<String>,
}

/// Outgoing message builder.
#[derive(Debug, Clone, Default)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

impl PublishMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

/// Delivery bookkeeping for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub deliveries: u64,
    /// Deliveries after the first for the same message.
    pub redeliveries: u64,
    pub acks: u64,
    pub nacks: u64,
    pub dead_lettered: u64,
    /// Messages waiting for (re)delivery.
    pub backlog: usize,
    /// Delivered and not yet settled.
    pub in_flight: usize,
}

#[derive(Debug)]
struct Pending {
    message: StoredMessage,
    attempts: u32,
    ready_at: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    name: String,
    config: SubscriptionConfig,
    queue: VecDeque<Pending>,
    in_flight: HashMap<String, Pending>,
    /// Ordering keys of delivered, unsettled messages.
    active_keys: HashSet<String>,
    stats: SubscriptionStats,
    notify: Arc<Notify>,
}

impl SubscriptionState {
    /// First deliverable queue position, or the earliest instant one becomes
    /// ready. Entries behind an active or earlier entry with the same
    /// ordering key are skipped.
    fn ready(&self, now: Instant) -> Result<usize, Option<Instant>> {
        let mut blocked: HashSet<&str> = self.active_keys.iter().map(String::as_str).collect();
        let mut until: Option<Instant> = None;
        for (pos, pending) in self.queue.iter().enumerate() {
            let key = ordering_key(&pending.message);
            if key.is_some_and(|key| blocked.contains(key)) {
                continue;
            }
            if pending.ready_at <= now {
                return Ok(pos);
            }
            until = Some(until.map_or(pending.ready_at, |u| u.min(pending.ready_at)));
            if let Some(key) = key {
                blocked.insert(key);
            }
        }
        Err(until)
    }

    fn release_key(&mut self, message: &StoredMessage) {
        if let Some(key) = ordering_key(message) {
            self.active_keys.remove(key);
            self.notify.notify_one();
        }
    }

    /// Queue a nacked message ahead of every waiting message with its key.
    fn requeue(&mut self, pending: Pending) {
        let head = ordering_key(&pending.message).and_then(|key| {
            self.queue
                .iter()
                .position(|p| ordering_key(&p.message) == Some(key))
        });
        match head {
            Some(pos) => self.queue.insert(pos, pending),
            None => self.queue.push_back(pending),
        }
        self.notify.notify_one();
    }
}

fn ordering_key(message: &StoredMessage) -> Option<&str> {
    message.ordering_key.as_deref().filter(|key| !key.is_empty())
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<StoredMessage>>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
}

#[derive(Debug)]
struct Inner {
    project_id: String,
    state: Mutex<State>,
    open_clients: AtomicUsize,
}

enum Next {
    Ready(Box<ReceivedMessage>),
    Wait {
        notify: Arc<Notify>,
        until: Option<Instant>,
    },
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // State stays consistent across panics: every mutation completes
        // under the lock before any await.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_locked(state: &mut State, topic: &str, message: PublishMessage) -> String {
        state.next_message_id += 1;
        let stored = StoredMessage {
            id: state.next_message_id.to_string(),
            data: message.data,
            attributes: message.attributes,
            publish_time: Utc::now(),
            ordering_key: message.ordering_key,
        };

        let now = Instant::now();
        for sub in state.subscriptions.values_mut() {
            if sub.config.topic == topic {
                sub.queue.push_back(Pending {
                    message: stored.clone(),
                    attempts: 0,
                    ready_at: now,
                });
                sub.notify.notify_one();
            }
        }

        let id = stored.id.clone();
        state.topics.entry(topic.to_string()).or_default().push(stored);
        id
    }

    fn next(self: &Arc<Self>, subscription: &str) -> Result<Next, BrokerError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            return Err(BrokerError::SubscriptionNotFound(subscription.to_string()));
        };

        let ready = match sub.ready(Instant::now()) {
            Ok(pos) => sub.queue.remove(pos),
            Err(until) => {
                return Ok(Next::Wait {
                    notify: sub.notify.clone(),
                    until,
                });
            }
        };
        let Some(mut pending) = ready else {
            return Ok(Next::Wait {
                notify: sub.notify.clone(),
                until: None,
            });
        };
        if let Some(key) = ordering_key(&pending.message) {
            sub.active_keys.insert(key.to_string());
        }

        pending.attempts += 1;
        sub.stats.deliveries += 1;
        if pending.attempts > 1 {
            sub.stats.redeliveries += 1;
        }

        state.next_ack_id += 1;
        let ack_id = format!("{subscription}/{}", state.next_ack_id);
        let acker: Arc<dyn Acknowledger> = Arc::new(MemoryAcker {
            inner: self.clone(),
            subscription: subscription.to_string(),
        });

        let mut message = ReceivedMessage::new(
            pending.message.id.clone(),
            pending.message.data.clone(),
            ack_id.clone(),
            acker,
        );
        message.attributes = pending.message.attributes.clone();
        message.publish_time = pending.message.publish_time;
        message.ordering_key = pending.message.ordering_key.clone();
        message.delivery_attempt = Some(pending.attempts);

        sub.in_flight.insert(ack_id, pending);
        Ok(Next::Ready(Box::new(message)))
    }

    fn settle(&self, subscription: &str, ack_id: &str, ack: bool) {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(sub) = state.subscriptions.get_mut(subscription) else {
            warn!(subscription, ack_id, "settling message of deleted subscription");
            return;
        };
        let Some(mut pending) = sub.in_flight.remove(ack_id) else {
            warn!(subscription, ack_id, "unknown or already settled ack id");
            return;
        };

        sub.release_key(&pending.message);
        if ack {
            sub.stats.acks += 1;
            return;
        }
        sub.stats.nacks += 1;

        let exhausted = sub.config.dead_letter_policy.as_ref().filter(|dl| {
            dl.max_delivery_attempts > 0 && pending.attempts >= dl.max_delivery_attempts
        });
        match exhausted {
            Some(dead_letter) => {
                sub.stats.dead_lettered += 1;
                let topic = dead_letter.topic.clone();
                let mut forwarded = PublishMessage {
                    data: pending.message.data,
                    attributes: pending.message.attributes,
                    ordering_key: pending.message.ordering_key,
                };
                forwarded
                    .attributes
                    .insert(DEAD_LETTER_SOURCE_SUBSCRIPTION.to_string(), sub.name.clone());
                forwarded.attributes.insert(
                    DEAD_LETTER_DELIVERY_ATTEMPTS.to_string(),
                    pending.attempts.to_string(),
                );
                debug!(subscription, topic = %topic, "forwarding message to dead-letter topic");
                Self::publish_locked(state, &topic, forwarded);
            }
            None => {
                let backoff =
                    redelivery_backoff(sub.config.retry_policy.as_ref(), pending.attempts);
                pending.ready_at = Instant::now() + backoff;
                sub.requeue(pending);
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    subscription: String,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, ack_id: &str) {
        self.inner.settle(&self.subscription, ack_id, true);
    }

    async fn nack(&self, ack_id: &str) {
        self.inner.settle(&self.subscription, ack_id, false);
    }
}

/// In-memory broker client.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    closed: CancellationToken,
    counted: bool,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("project_id", &self.inner.project_id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                project_id: project_id.into(),
                state: Mutex::new(State::default()),
                open_clients: AtomicUsize::new(0),
            }),
            closed: CancellationToken::new(),
            counted: false,
        }
    }

    /// Create `topic` if missing and return its resource name.
    pub fn create_topic(&self, topic: &str) -> String {
        let name = topic_name(&self.inner.project_id, topic);
        self.inner.state().topics.entry(name.clone()).or_default();
        name
    }

    /// Create subscription `id` attached to `config.topic`.
    pub fn create_subscription(
        &self,
        id: &str,
        mut config: SubscriptionConfig,
    ) -> Result<String, BrokerError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(BrokerError::InvalidConfig("subscription id is empty".to_string()));
        }
        config.topic = topic_name(&self.inner.project_id, &config.topic);

        let mut state = self.inner.state();
        if !state.topics.contains_key(&config.topic) {
            return Err(BrokerError::TopicNotFound(config.topic));
        }
        if state.subscriptions.contains_key(id) {
            return Err(BrokerError::SubscriptionExists(id.to_string()));
        }

        let name = subscription_name(&self.inner.project_id, id);
        state.subscriptions.insert(
            id.to_string(),
            SubscriptionState {
                name: name.clone(),
                config,
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                active_keys: HashSet::new(),
                stats: SubscriptionStats::default(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(name)
    }

    /// Publish to an existing topic and return the message id.
    pub fn publish(&self, topic: &str, message: PublishMessage) -> Result<String, BrokerError> {
        let topic = topic_name(&self.inner.project_id, topic);
        let mut state = self.inner.state();
        if !state.topics.contains_key(&topic) {
            return Err(BrokerError::TopicNotFound(topic));
        }
        Ok(Inner::publish_locked(&mut state, &topic, message))
    }

    /// Every message published to `topic`, dead-letter forwards included.
    pub fn published(&self, topic: &str) -> Vec<StoredMessage> {
        let topic = topic_name(&self.inner.project_id, topic);
        self.inner
            .state()
            .topics
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self, subscription: &str) -> Option<SubscriptionStats> {
        self.inner.state().subscriptions.get(subscription).map(|sub| {
            let mut stats = sub.stats;
            stats.backlog = sub.queue.len();
            stats.in_flight = sub.in_flight.len();
            stats
        })
    }

    /// Clients obtained via `connect` and not yet closed.
    pub fn open_clients(&self) -> usize {
        self.inner.open_clients.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    fn subscription(&self, id: &str) -> Arc<dyn Subscription> {
        Arc::new(InMemorySubscription {
            broker: self.clone(),
            id: id.trim().to_string(),
            name: subscription_name(&self.inner.project_id, id),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            if self.counted {
                self.inner.open_clients.fetch_sub(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        if project_id.trim() != self.inner.project_id {
            return Err(BrokerError::Connection(format!(
                "emulator serves project {:?}, not {:?}",
                self.inner.project_id, project_id
            )));
        }
        self.inner.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryBroker {
            inner: self.inner.clone(),
            closed: CancellationToken::new(),
            counted: true,
        }))
    }
}

struct InMemorySubscription {
    broker: InMemoryBroker,
    id: String,
    name: String,
}

impl InMemorySubscription {
    async fn next_delivery(&self) -> Result<ReceivedMessage, BrokerError> {
        loop {
            match self.broker.inner.next(&self.id)? {
                Next::Ready(message) => return Ok(*message),
                Next::Wait { notify, until } => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = sleep_until(until) => {}
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn log_join(subscription: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(subscription, error = %err, "message handler task failed");
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool, BrokerError> {
        if self.broker.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        Ok(self.broker.inner.state().subscriptions.contains_key(&self.id))
    }

    async fn config(&self) -> Result<SubscriptionConfig, BrokerError> {
        self.broker
            .inner
            .state()
            .subscriptions
            .get(&self.id)
            .map(|sub| sub.config.clone())
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.name.clone()))
    }

    async fn update(
        &self,
        update: SubscriptionConfigUpdate,
    ) -> Result<SubscriptionConfig, BrokerError> {
        if self.broker.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if let Some(dead_letter) = &update.dead_letter_policy {
            if dead_letter.topic.trim().is_empty() {
                return Err(BrokerError::InvalidConfig(
                    "dead-letter topic is empty".to_string(),
                ));
            }
        }

        let mut state = self.broker.inner.state();
        let sub = state
            .subscriptions
            .get_mut(&self.id)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.name.clone()))?;
        update.apply_to(&mut sub.config);
        Ok(sub.config.clone())
    }

    async fn receive(
        &self,
        cancel: CancellationToken,
        settings: ReceiveSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        if !self.exists().await? {
            return Err(BrokerError::SubscriptionNotFound(self.name.clone()));
        }

        let permits = Arc::new(Semaphore::new(settings.max_outstanding_messages.max(1)));
        let mut in_flight = JoinSet::new();

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = self.broker.closed.cancelled() => break Err(BrokerError::Closed),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(BrokerError::Closed),
                },
            };

            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = self.broker.closed.cancelled() => break Err(BrokerError::Closed),
                next = self.next_delivery() => match next {
                    Ok(message) => message,
                    Err(err) => break Err(err),
                },
            };

            let handler = handler.clone();
            let ctx = cancel.clone();
            in_flight.spawn(async move {
                handler.handle(ctx, message).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                log_join(&self.name, joined);
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            log_join(&self.name, joined);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::DeadLetterTarget;
    use hanko_jobs_core::RetryPolicy;
    use std::time::Duration;

    /// Nacks the first `nacks` deliveries, acks the rest, and cancels the
    /// receive loop after `stop_after` deliveries.
    struct Scripted {
        nacks: usize,
        stop_after: usize,
        seen: Mutex<Vec<(String, Option<u32>)>>,
        done: CancellationToken,
    }

    impl Scripted {
        fn new(nacks: usize, stop_after: usize, done: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                nacks,
                stop_after,
                seen: Mutex::new(Vec::new()),
                done,
            })
        }

        fn seen(&self) -> Vec<(String, Option<u32>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, _ctx: CancellationToken, message: ReceivedMessage) {
            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push((message.id.clone(), message.delivery_attempt));
                seen.len()
            };
            if count <= self.nacks {
                message.nack().await;
            } else {
                message.ack().await;
            }
            if count >= self.stop_after {
                self.done.cancel();
            }
        }
    }

    fn broker_with_subscription(config: SubscriptionConfig) -> InMemoryBroker {
        let broker = InMemoryBroker::new("test");
        broker.create_topic("jobs");
        broker.create_topic("jobs-dlq");
        broker.create_subscription("jobs-sub", config).unwrap();
        broker
    }

    fn jobs_config() -> SubscriptionConfig {
        SubscriptionConfig {
            topic: "jobs".to_string(),
            ..Default::default()
        }
    }

    async fn receive(broker: &InMemoryBroker, handler: Arc<Scripted>, cancel: CancellationToken) {
        let sub = broker.subscription("jobs-sub");
        tokio::time::timeout(
            Duration::from_secs(5),
            sub.receive(cancel, ReceiveSettings::default(), handler),
        )
        .await
        .expect("receive loop did not stop")
        .unwrap();
    }

    #[tokio::test]
    async fn delivers_and_acks() {
        let broker = broker_with_subscription(jobs_config());
        let id = broker
            .publish("jobs", PublishMessage::new("hello").with_attribute("kind", "ai"))
            .unwrap();

        let cancel = CancellationToken::new();
        let handler = Scripted::new(0, 1, cancel.clone());
        receive(&broker, handler.clone(), cancel).await;

        assert_eq!(handler.seen(), vec![(id, Some(1))]);
        let stats = broker.stats("jobs-sub").unwrap();
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.nacks, 0);
        assert_eq!(stats.backlog, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let mut config = jobs_config();
        config.retry_policy = Some(RetryPolicy {
            minimum_backoff: Duration::from_millis(10),
            maximum_backoff: Duration::from_millis(40),
        });
        let broker = broker_with_subscription(config);
        let id = broker.publish("jobs", PublishMessage::new("x")).unwrap();

        let cancel = CancellationToken::new();
        let handler = Scripted::new(2, 3, cancel.clone());
        receive(&broker, handler.clone(), cancel).await;

        assert_eq!(
            handler.seen(),
            vec![
                (id.clone(), Some(1)),
                (id.clone(), Some(2)),
                (id, Some(3))
            ]
        );
        let stats = broker.stats("jobs-sub").unwrap();
        assert_eq!(stats.nacks, 2);
        assert_eq!(stats.redeliveries, 2);
        assert_eq!(stats.acks, 1);
    }

    #[tokio::test]
    async fn exhausted_messages_are_dead_lettered() {
        let mut config = jobs_config();
        config.dead_letter_policy = Some(DeadLetterTarget {
            topic: "projects/test/topics/jobs-dlq".to_string(),
            max_delivery_attempts: 2,
        });
        let broker = broker_with_subscription(config);
        broker
            .publish("jobs", PublishMessage::new("poison").with_attribute("kind", "ai"))
            .unwrap();

        let cancel = CancellationToken::new();
        let handler = Scripted::new(2, 2, cancel.clone());
        receive(&broker, handler, cancel).await;

        let stats = broker.stats("jobs-sub").unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.backlog, 0);

        let forwarded = broker.published("jobs-dlq");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].data, b"poison");
        assert_eq!(forwarded[0].attributes["kind"], "ai");
        assert_eq!(
            forwarded[0].attributes[DEAD_LETTER_SOURCE_SUBSCRIPTION],
            "projects/test/subscriptions/jobs-sub"
        );
        assert_eq!(forwarded[0].attributes[DEAD_LETTER_DELIVERY_ATTEMPTS], "2");
    }

    #[tokio::test]
    async fn receive_on_missing_subscription_fails() {
        let broker = InMemoryBroker::new("test");
        let sub = broker.subscription("missing");
        assert!(!sub.exists().await.unwrap());

        let handler = Scripted::new(0, 1, CancellationToken::new());
        let err = sub
            .receive(CancellationToken::new(), ReceiveSettings::default(), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn close_stops_receive_and_releases_client() {
        let broker = broker_with_subscription(jobs_config());
        let client = broker.connect("test").await.unwrap();
        assert_eq!(broker.open_clients(), 1);

        let sub = client.subscription("jobs-sub");
        let handler = Scripted::new(0, usize::MAX, CancellationToken::new());
        let receiving = tokio::spawn(async move {
            sub.receive(CancellationToken::new(), ReceiveSettings::default(), handler)
                .await
        });

        client.close().await.unwrap();
        let result = receiving.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert_eq!(broker.open_clients(), 0);
    }

    #[tokio::test]
    async fn connect_rejects_foreign_project() {
        let broker = InMemoryBroker::new("test");
        assert!(matches!(
            broker.connect("other").await,
            Err(BrokerError::Connection(_))
        ));
    }

    /// Tracks concurrent deliveries per ordering key; nacks the first
    /// delivery of `nack_data` when set.
    struct KeyTracker {
        nack_data: Option<&'static str>,
        stop_after: usize,
        active: Mutex<HashMap<String, usize>>,
        max_active: Mutex<HashMap<String, usize>>,
        seen: Mutex<Vec<(String, Option<u32>)>>,
        done: CancellationToken,
    }

    impl KeyTracker {
        fn new(nack_data: Option<&'static str>, stop_after: usize) -> Arc<Self> {
            Arc::new(Self {
                nack_data,
                stop_after,
                active: Mutex::new(HashMap::new()),
                max_active: Mutex::new(HashMap::new()),
                seen: Mutex::new(Vec::new()),
                done: CancellationToken::new(),
            })
        }

        fn max_active(&self, key: &str) -> usize {
            self.max_active.lock().unwrap().get(key).copied().unwrap_or(0)
        }

        fn seen(&self) -> Vec<(String, Option<u32>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for KeyTracker {
        async fn handle(&self, _ctx: CancellationToken, message: ReceivedMessage) {
            let key = message.ordering_key.clone().unwrap_or_default();
            {
                let mut active = self.active.lock().unwrap();
                let count = active.entry(key.clone()).or_default();
                *count += 1;
                let mut max_active = self.max_active.lock().unwrap();
                let max = max_active.entry(key.clone()).or_default();
                *max = (*max).max(*count);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;

            let data = String::from_utf8_lossy(&message.data).into_owned();
            let nack = self.nack_data == Some(data.as_str()) && message.delivery_attempt == Some(1);
            let count = {
                let mut seen = self.seen.lock().unwrap();
                seen.push((data, message.delivery_attempt));
                seen.len()
            };
            *self.active.lock().unwrap().entry(key).or_default() -= 1;

            if nack {
                message.nack().await;
            } else {
                message.ack().await;
            }
            if count >= self.stop_after {
                self.done.cancel();
            }
        }
    }

    async fn receive_tracked(broker: &InMemoryBroker, handler: Arc<KeyTracker>) {
        let sub = broker.subscription("jobs-sub");
        let settings = ReceiveSettings {
            max_outstanding_messages: 10,
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            sub.receive(handler.done.clone(), settings, handler.clone()),
        )
        .await
        .expect("receive loop did not stop")
        .unwrap();
    }

    #[tokio::test]
    async fn same_ordering_key_is_delivered_one_at_a_time() {
        let broker = broker_with_subscription(jobs_config());
        broker
            .publish("jobs", PublishMessage::new("a").with_ordering_key("k"))
            .unwrap();
        broker
            .publish("jobs", PublishMessage::new("b").with_ordering_key("k"))
            .unwrap();
        broker.publish("jobs", PublishMessage::new("c")).unwrap();

        let handler = KeyTracker::new(None, 3);
        receive_tracked(&broker, handler.clone()).await;

        assert_eq!(handler.max_active("k"), 1);
        let keyed: Vec<String> = handler
            .seen()
            .into_iter()
            .map(|(data, _)| data)
            .filter(|data| data != "c")
            .collect();
        assert_eq!(keyed, vec!["a", "b"]);
        assert_eq!(broker.stats("jobs-sub").unwrap().acks, 3);
    }

    #[tokio::test]
    async fn nacked_message_is_redelivered_before_later_ones_with_its_key() {
        let mut config = jobs_config();
        config.retry_policy = Some(RetryPolicy {
            minimum_backoff: Duration::from_millis(10),
            maximum_backoff: Duration::from_millis(40),
        });
        let broker = broker_with_subscription(config);
        broker
            .publish("jobs", PublishMessage::new("a").with_ordering_key("k"))
            .unwrap();
        broker
            .publish("jobs", PublishMessage::new("b").with_ordering_key("k"))
            .unwrap();

        let handler = KeyTracker::new(Some("a"), 3);
        receive_tracked(&broker, handler.clone()).await;

        assert_eq!(handler.max_active("k"), 1);
        assert_eq!(
            handler.seen(),
            vec![
                ("a".to_string(), Some(1)),
                ("a".to_string(), Some(2)),
                ("b".to_string(), Some(1)),
            ]
        );
    }

    #[tokio::test]
    async fn publish_requires_topic() {
        let broker = InMemoryBroker::new("test");
        assert!(matches!(
            broker.publish("missing", PublishMessage::new("x")),
            Err(BrokerError::TopicNotFound(_))
        ));
        assert!(matches!(
            broker.create_subscription("s", jobs_config()),
            Err(BrokerError::TopicNotFound(_))
        ));
    }
}
