//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! Maps the broker contract onto Redis Streams:
//! - **Topic**: one stream per topic (`{prefix}:topic:{topic}`)
//! - **Subscription**: a consumer group on the topic stream, named after the
//!   subscription resource, with its configuration in a hash
//!   (`{prefix}:sub:{subscription}`)
//! - **Ack**: `XACK`
//! - **Nack**: the entry is parked on a dedicated consumer and scheduled in a
//!   sorted set (`{prefix}:sub:{subscription}:retry`) for re-claim after the
//!   retry backoff
//! - **Delivery attempts**: the pending-entry delivery counter
//! - **Dead-letter**: once attempts reach `max_delivery_attempts` a nacked
//!   entry is `XADD`ed to the dead-letter topic stream and acknowledged
//!
//! Entries left pending by a crashed consumer are re-claimed once idle longer
//! than the ack deadline.
//!
//! Entries sharing an ordering key are dispatched one at a time within a
//! receive loop: later entries are held locally until the key holder is acked
//! or dead-lettered. A nacked holder keeps its key across the retry backoff.
//! Ordering is not kept across consumers or restarts.
//!
//! The client is synchronous; every command runs on the blocking pool.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use hanko_jobs_broker::{
    Acknowledger, Broker, BrokerConnector, BrokerError, DEAD_LETTER_DELIVERY_ATTEMPTS,
    DEAD_LETTER_SOURCE_SUBSCRIPTION, DeadLetterTarget, MessageHandler, PublishMessage,
    ReceiveSettings, ReceivedMessage, Subscription, SubscriptionConfig, SubscriptionConfigUpdate,
    redelivery_backoff, subscription_name, topic_name,
};
use hanko_jobs_core::RetryPolicy;

/// Default key prefix
const DEFAULT_KEY_PREFIX: &str = "hanko:jobs";

/// Consumer that owns nacked entries while they wait for their backoff
const PARKED_CONSUMER: &str = "parked";

/// Pending entries idle longer than this are re-claimed
const DEFAULT_ACK_DEADLINE_MS: u64 = 60_000;

/// XREADGROUP blocking timeout; bounds shutdown latency
const DEFAULT_BLOCK_MS: u64 = 500;

/// Upper bound on entries fetched per poll
const MAX_BATCH: usize = 10;

const FIELD_DATA: &str = "data";
const FIELD_ATTRIBUTES: &str = "attributes";
const FIELD_PUBLISH_TIME: &str = "publish_time";
const FIELD_ORDERING_KEY: &str = "ordering_key";

const CONFIG_TOPIC: &str = "topic";
const CONFIG_RETRY_MIN_MS: &str = "retry_min_ms";
const CONFIG_RETRY_MAX_MS: &str = "retry_max_ms";
const CONFIG_DLQ_TOPIC: &str = "dlq_topic";
const CONFIG_DLQ_MAX_ATTEMPTS: &str = "dlq_max_attempts";

/// Connector opening [`RedisStreamsBroker`] clients for a Redis URL.
#[derive(Debug, Clone)]
pub struct RedisStreamsConnector {
    url: String,
    key_prefix: String,
}

impl RedisStreamsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

#[async_trait]
impl BrokerConnector for RedisStreamsConnector {
    async fn connect(&self, project_id: &str) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = RedisStreamsBroker::open(&self.url, project_id)?
            .with_key_prefix(self.key_prefix.clone());
        broker
            .blocking(|conn| {
                redis::cmd("PING")
                    .query::<String>(conn)
                    .map_err(|e| BrokerError::Connection(e.to_string()))
            })
            .await?;
        Ok(Arc::new(broker))
    }
}

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    project_id: String,
    key_prefix: String,
    consumer: String,
    ack_deadline_ms: u64,
    block_ms: u64,
    closed: CancellationToken,
}

impl fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("project_id", &self.project_id)
            .field("key_prefix", &self.key_prefix)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisStreamsBroker {
    /// Create a client for `redis_url` (e.g. "redis://localhost:6379").
    pub fn open(redis_url: &str, project_id: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            project_id: project_id.trim().to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            ack_deadline_ms: DEFAULT_ACK_DEADLINE_MS,
            block_ms: DEFAULT_BLOCK_MS,
            closed: CancellationToken::new(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline_ms = deadline.as_millis().max(1) as u64;
        self
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.key_prefix, topic)
    }

    fn config_key(&self, subscription: &str) -> String {
        format!("{}:sub:{}", self.key_prefix, subscription)
    }

    fn retry_key(&self, subscription: &str) -> String {
        format!("{}:sub:{}:retry", self.key_prefix, subscription)
    }

    /// Run `f` with a fresh connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce(&mut redis::Connection) -> Result<T, BrokerError> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| BrokerError::Connection(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Command(format!("redis task failed: {e}")))?
    }

    /// Create subscription `id` on `topic` (idempotent).
    ///
    /// Only messages published after creation are delivered.
    pub async fn create_subscription(
        &self,
        id: &str,
        topic: &str,
    ) -> Result<String, BrokerError> {
        let name = subscription_name(&self.project_id, id);
        let topic = topic_name(&self.project_id, topic);
        let stream = self.stream_key(&topic);
        let config_key = self.config_key(&name);
        let group = name.clone();

        self.blocking(move |conn| {
            ensure_group(conn, &stream, &group, "$")?;
            redis::cmd("HSET")
                .arg(&config_key)
                .arg(CONFIG_TOPIC)
                .arg(&topic)
                .query::<i64>(conn)
                .map_err(|e| command("HSET", e))?;
            Ok(())
        })
        .await?;
        Ok(name)
    }

    /// Publish to `topic` and return the message id.
    pub async fn publish(
        &self,
        topic: &str,
        message: PublishMessage,
    ) -> Result<String, BrokerError> {
        let stream = self.stream_key(&topic_name(&self.project_id, topic));
        self.blocking(move |conn| xadd(conn, &stream, &message)).await
    }
}

fn command(op: &str, err: redis::RedisError) -> BrokerError {
    BrokerError::Command(format!("{op} failed: {err}"))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// XGROUP CREATE ... MKSTREAM; an existing group is not an error.
fn ensure_group(
    conn: &mut redis::Connection,
    stream: &str,
    group: &str,
    start: &str,
) -> Result<(), BrokerError> {
    let created: redis::RedisResult<String> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg(start)
        .arg("MKSTREAM")
        .query(conn);
    match created {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(command("XGROUP CREATE", e)),
    }
}

fn encode_fields(message: &PublishMessage) -> Result<Vec<(String, Vec<u8>)>, BrokerError> {
    let attributes = serde_json::to_string(&message.attributes)
        .map_err(|e| BrokerError::Command(format!("attributes serialization failed: {e}")))?;

    let mut fields = vec![
        (FIELD_DATA.to_string(), message.data.clone()),
        (FIELD_ATTRIBUTES.to_string(), attributes.into_bytes()),
        (
            FIELD_PUBLISH_TIME.to_string(),
            Utc::now().to_rfc3339().into_bytes(),
        ),
    ];
    if let Some(key) = &message.ordering_key {
        fields.push((FIELD_ORDERING_KEY.to_string(), key.clone().into_bytes()));
    }
    Ok(fields)
}

fn xadd(
    conn: &mut redis::Connection,
    stream: &str,
    message: &PublishMessage,
) -> Result<String, BrokerError> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (field, value) in encode_fields(message)? {
        cmd.arg(field).arg(value);
    }
    cmd.query(conn).map_err(|e| command("XADD", e))
}

/// Entry decoded from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    data: Vec<u8>,
    attributes: HashMap<String, String>,
    publish_time: DateTime<Utc>,
    ordering_key: Option<String>,
}

fn field_bytes(entry: &StreamId, field: &str) -> Option<Vec<u8>> {
    entry
        .map
        .get(field)
        .and_then(|value| redis::from_redis_value::<Vec<u8>>(value).ok())
}

fn field_string(entry: &StreamId, field: &str) -> Option<String> {
    field_bytes(entry, field).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_entry(entry: &StreamId) -> StreamEntry {
    let attributes = match field_string(entry, FIELD_ATTRIBUTES) {
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(message_id = %entry.id, error = %e, "dropping malformed stream attributes");
            HashMap::new()
        }),
        None => HashMap::new(),
    };
    let publish_time = field_string(entry, FIELD_PUBLISH_TIME)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    StreamEntry {
        id: entry.id.clone(),
        data: field_bytes(entry, FIELD_DATA).unwrap_or_default(),
        attributes,
        publish_time,
        ordering_key: field_string(entry, FIELD_ORDERING_KEY),
    }
}

fn encode_config(config: &SubscriptionConfigUpdate) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(retry) = &config.retry_policy {
        fields.push((CONFIG_RETRY_MIN_MS, retry.minimum_backoff.as_millis().to_string()));
        fields.push((CONFIG_RETRY_MAX_MS, retry.maximum_backoff.as_millis().to_string()));
    }
    if let Some(dead_letter) = &config.dead_letter_policy {
        fields.push((CONFIG_DLQ_TOPIC, dead_letter.topic.clone()));
        fields.push((
            CONFIG_DLQ_MAX_ATTEMPTS,
            dead_letter.max_delivery_attempts.to_string(),
        ));
    }
    fields
}

fn decode_config(fields: &HashMap<String, String>) -> SubscriptionConfig {
    let millis = |key: &str| {
        fields
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    };

    let retry_policy = match (millis(CONFIG_RETRY_MIN_MS), millis(CONFIG_RETRY_MAX_MS)) {
        (None, None) => None,
        (min, max) => Some(RetryPolicy {
            minimum_backoff: min.unwrap_or_default(),
            maximum_backoff: max.unwrap_or_default(),
        }),
    };

    let dead_letter_policy = fields
        .get(CONFIG_DLQ_TOPIC)
        .filter(|topic| !topic.is_empty())
        .map(|topic| DeadLetterTarget {
            topic: topic.clone(),
            max_delivery_attempts: fields
                .get(CONFIG_DLQ_MAX_ATTEMPTS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        });

    SubscriptionConfig {
        topic: fields.get(CONFIG_TOPIC).cloned().unwrap_or_default(),
        retry_policy,
        dead_letter_policy,
    }
}

fn load_config(
    conn: &mut redis::Connection,
    config_key: &str,
) -> Result<Option<SubscriptionConfig>, BrokerError> {
    let fields: HashMap<String, String> = redis::cmd("HGETALL")
        .arg(config_key)
        .query(conn)
        .map_err(|e| command("HGETALL", e))?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(decode_config(&fields)))
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn subscription(&self, id: &str) -> Arc<dyn Subscription> {
        let name = subscription_name(&self.project_id, id);
        Arc::new(RedisStreamsSubscription {
            broker: self.clone(),
            id: id.trim().to_string(),
            config_key: self.config_key(&name),
            retry_key: self.retry_key(&name),
            name,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.cancel();
        Ok(())
    }
}

/// Subscription backed by a consumer group.
pub struct RedisStreamsSubscription {
    broker: RedisStreamsBroker,
    id: String,
    name: String,
    config_key: String,
    retry_key: String,
}

/// Per-receive state shared by the poll loop and the ackers.
struct ReceiveContext {
    broker: RedisStreamsBroker,
    subscription: String,
    stream: String,
    config_key: String,
    retry_key: String,
    in_flight: Mutex<HashMap<String, InFlight>>,
    ordering: Mutex<OrderingGate>,
}

#[derive(Debug)]
struct InFlight {
    entry: StreamEntry,
    attempts: u32,
}

impl InFlight {
    fn ordering_key(&self) -> Option<&str> {
        self.entry.ordering_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Holds back entries whose ordering key is taken by an unsettled entry.
#[derive(Debug, Default)]
struct OrderingGate {
    /// Entry id holding each key.
    holders: HashMap<String, String>,
    waiting: HashMap<String, VecDeque<InFlight>>,
    /// Entries handed a released key, not yet dispatched.
    ready: VecDeque<InFlight>,
}

impl OrderingGate {
    /// Returns the delivery when it may be dispatched now.
    fn admit(&mut self, delivery: InFlight) -> Option<InFlight> {
        let Some(key) = delivery.ordering_key() else {
            return Some(delivery);
        };
        match self.holders.get(key) {
            None => {
                self.holders
                    .insert(key.to_string(), delivery.entry.id.clone());
                Some(delivery)
            }
            Some(holder) if *holder == delivery.entry.id => Some(delivery),
            Some(_) => {
                let queue = self.waiting.entry(key.to_string()).or_default();
                // A waiting entry can be re-claimed as stale while held here.
                if !queue.iter().any(|w| w.entry.id == delivery.entry.id) {
                    queue.push_back(delivery);
                }
                None
            }
        }
    }

    /// Pass `key` from `id` to the next waiting entry.
    fn release(&mut self, key: &str, id: &str) {
        if self.holders.get(key).map(String::as_str) != Some(id) {
            return;
        }
        self.holders.remove(key);
        let Some(queue) = self.waiting.get_mut(key) else {
            return;
        };
        if let Some(next) = queue.pop_front() {
            self.holders.insert(key.to_string(), next.entry.id.clone());
            self.ready.push_back(next);
        }
        if queue.is_empty() {
            self.waiting.remove(key);
        }
    }

    fn take_ready(&mut self, max: usize) -> Vec<InFlight> {
        let count = self.ready.len().min(max);
        self.ready.drain(..count).collect()
    }
}

/// What a nack does to an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    DeadLetter(DeadLetterTarget),
    Retry(Duration),
}

fn nack_disposition(config: &SubscriptionConfig, attempts: u32) -> Disposition {
    let exhausted = config
        .dead_letter_policy
        .as_ref()
        .filter(|dl| dl.max_delivery_attempts > 0 && attempts >= dl.max_delivery_attempts);
    match exhausted {
        Some(dead_letter) => Disposition::DeadLetter(dead_letter.clone()),
        None => Disposition::Retry(redelivery_backoff(config.retry_policy.as_ref(), attempts)),
    }
}

impl ReceiveContext {
    fn group(&self) -> &str {
        &self.subscription
    }

    fn take(&self, ack_id: &str) -> Option<InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ack_id)
    }

    /// Fetch up to `count` deliveries: due retries first, then stale
    /// pending entries, then new entries (blocking briefly).
    fn poll(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<InFlight>, BrokerError> {
        let retried = self.claim_due_retries(conn, count)?;
        if !retried.is_empty() {
            return Ok(retried);
        }
        let stale = self.claim_stale(conn, count)?;
        if !stale.is_empty() {
            return Ok(stale);
        }
        self.read_new(conn, count)
    }

    fn claim_due_retries(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<InFlight>, BrokerError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.retry_key)
            .arg("-inf")
            .arg(now_ms())
            .arg("LIMIT")
            .arg(0)
            .arg(count)
            .query(conn)
            .map_err(|e| command("ZRANGEBYSCORE", e))?;
        if due.is_empty() {
            return Ok(vec![]);
        }

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(self.group())
            .arg(&self.broker.consumer)
            .arg(0)
            .arg(&due[..])
            .query(conn)
            .map_err(|e| command("XCLAIM", e))?;
        let _: i64 = redis::cmd("ZREM")
            .arg(&self.retry_key)
            .arg(&due[..])
            .query(conn)
            .map_err(|e| command("ZREM", e))?;

        self.with_attempts(conn, claimed.ids)
    }

    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<InFlight>, BrokerError> {
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(self.group())
            .arg("IDLE")
            .arg(self.broker.ack_deadline_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(conn)
            .map_err(|e| command("XPENDING", e))?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.consumer != PARKED_CONSUMER)
            .map(|p| p.id)
            .collect();
        if stale.is_empty() {
            return Ok(vec![]);
        }

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(self.group())
            .arg(&self.broker.consumer)
            .arg(self.broker.ack_deadline_ms)
            .arg(&stale[..])
            .query(conn)
            .map_err(|e| command("XCLAIM", e))?;
        if !claimed.ids.is_empty() {
            debug!(
                subscription = %self.subscription,
                count = claimed.ids.len(),
                "re-claimed entries past their ack deadline"
            );
        }

        self.with_attempts(conn, claimed.ids)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        count: usize,
    ) -> Result<Vec<InFlight>, BrokerError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(self.group())
            .arg(&self.broker.consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(self.broker.block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query(conn)
            .map_err(|e| command("XREADGROUP", e))?;

        Ok(reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|key| key.ids)
            .map(|id| InFlight {
                entry: decode_entry(&id),
                attempts: 1,
            })
            .collect())
    }

    /// Pair claimed entries with their pending-entry delivery counter.
    fn with_attempts(
        &self,
        conn: &mut redis::Connection,
        ids: Vec<StreamId>,
    ) -> Result<Vec<InFlight>, BrokerError> {
        let mut deliveries = Vec::with_capacity(ids.len());
        for id in ids {
            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&self.stream)
                .arg(self.group())
                .arg(&id.id)
                .arg(&id.id)
                .arg(1)
                .query(conn)
                .map_err(|e| command("XPENDING", e))?;
            let attempts = pending
                .ids
                .first()
                .map(|p| p.times_delivered.min(u32::MAX as usize) as u32)
                .unwrap_or(1);
            deliveries.push(InFlight {
                entry: decode_entry(&id),
                attempts,
            });
        }
        Ok(deliveries)
    }

    fn ack_sync(&self, conn: &mut redis::Connection, id: &str) -> Result<(), BrokerError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(self.group())
            .arg(id)
            .query(conn)
            .map_err(|e| command("XACK", e))?;
        Ok(())
    }

    fn nack_sync(
        &self,
        conn: &mut redis::Connection,
        in_flight: InFlight,
    ) -> Result<Disposition, BrokerError> {
        let config = load_config(conn, &self.config_key)?.unwrap_or_default();
        let id = in_flight.entry.id.clone();

        let dead_letter = match nack_disposition(&config, in_flight.attempts) {
            Disposition::Retry(backoff) => {
                self.park(conn, &id, backoff)?;
                return Ok(Disposition::Retry(backoff));
            }
            Disposition::DeadLetter(dead_letter) => dead_letter,
        };

        let mut forwarded = PublishMessage {
            data: in_flight.entry.data,
            attributes: in_flight.entry.attributes,
            ordering_key: in_flight.entry.ordering_key,
        };
        forwarded
            .attributes
            .insert(DEAD_LETTER_SOURCE_SUBSCRIPTION.to_string(), self.subscription.clone());
        forwarded.attributes.insert(
            DEAD_LETTER_DELIVERY_ATTEMPTS.to_string(),
            in_flight.attempts.to_string(),
        );
        let dlq_stream = self.broker.stream_key(&dead_letter.topic);
        xadd(conn, &dlq_stream, &forwarded)?;
        self.ack_sync(conn, &id)?;
        warn!(
            subscription = %self.subscription,
            message_id = %id,
            delivery_attempt = in_flight.attempts,
            topic = %dead_letter.topic,
            "message sent to dead-letter topic"
        );
        Ok(Disposition::DeadLetter(dead_letter))
    }

    /// Move `id` to the parked consumer and schedule it after `backoff`.
    fn park(
        &self,
        conn: &mut redis::Connection,
        id: &str,
        backoff: Duration,
    ) -> Result<(), BrokerError> {
        let _: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(self.group())
            .arg(PARKED_CONSUMER)
            .arg(0)
            .arg(id)
            .arg("JUSTID")
            .query(conn)
            .map_err(|e| command("XCLAIM", e))?;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.retry_key)
            .arg(now_ms() + backoff.as_millis() as i64)
            .arg(id)
            .query(conn)
            .map_err(|e| command("ZADD", e))?;
        Ok(())
    }

    fn release_key(&self, key: &str, id: &str) {
        self.ordering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(key, id);
    }

    fn admit(&self, delivery: InFlight) -> Option<InFlight> {
        self.ordering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(delivery)
    }

    fn take_ready(&self, max: usize) -> Vec<InFlight> {
        self.ordering
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_ready(max)
    }
}

struct RedisAcker {
    context: Arc<ReceiveContext>,
}

impl RedisAcker {
    async fn settle(&self, ack_id: &str, ack: bool) {
        let Some(in_flight) = self.context.take(ack_id) else {
            warn!(ack_id, "unknown or already settled ack id");
            return;
        };
        let context = self.context.clone();
        let id = ack_id.to_string();
        let key = in_flight.ordering_key().map(str::to_string);
        let settled = self
            .context
            .broker
            .blocking(move |conn| {
                if ack {
                    context.ack_sync(conn, &in_flight.entry.id)?;
                    return Ok(true);
                }
                let disposition = context.nack_sync(conn, in_flight)?;
                Ok(matches!(disposition, Disposition::DeadLetter(_)))
            })
            .await;
        match settled {
            // A nacked holder keeps its key until redelivered.
            Ok(true) => {
                if let Some(key) = key {
                    self.context.release_key(&key, &id);
                }
            }
            Ok(false) => {}
            // The entry stays pending and is re-claimed after the ack deadline.
            Err(err) => error!(
                subscription = %self.context.subscription,
                message_id = %id,
                ack,
                error = %err,
                "failed to settle message"
            ),
        }
    }
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, ack_id: &str) {
        self.settle(ack_id, true).await;
    }

    async fn nack(&self, ack_id: &str) {
        self.settle(ack_id, false).await;
    }
}

fn log_join(subscription: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(subscription, error = %err, "message handler task failed");
    }
}

#[async_trait]
impl Subscription for RedisStreamsSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self) -> Result<bool, BrokerError> {
        let key = self.config_key.clone();
        self.broker
            .blocking(move |conn| {
                redis::cmd("EXISTS")
                    .arg(&key)
                    .query::<bool>(conn)
                    .map_err(|e| command("EXISTS", e))
            })
            .await
    }

    async fn config(&self) -> Result<SubscriptionConfig, BrokerError> {
        let key = self.config_key.clone();
        self.broker
            .blocking(move |conn| load_config(conn, &key))
            .await?
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.name.clone()))
    }

    async fn update(
        &self,
        update: SubscriptionConfigUpdate,
    ) -> Result<SubscriptionConfig, BrokerError> {
        let key = self.config_key.clone();
        let name = self.name.clone();
        let fields = encode_config(&update);

        self.broker
            .blocking(move |conn| {
                if load_config(conn, &key)?.is_none() {
                    return Err(BrokerError::SubscriptionNotFound(name));
                }
                if !fields.is_empty() {
                    // A single HSET applies every field atomically.
                    let mut cmd = redis::cmd("HSET");
                    cmd.arg(&key);
                    for (field, value) in &fields {
                        cmd.arg(*field).arg(value);
                    }
                    cmd.query::<i64>(conn).map_err(|e| command("HSET", e))?;
                }
                load_config(conn, &key)?.ok_or(BrokerError::SubscriptionNotFound(name))
            })
            .await
    }

    async fn receive(
        &self,
        cancel: CancellationToken,
        settings: ReceiveSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let config = self.config().await?;
        let stream = self.broker.stream_key(&config.topic);
        let context = Arc::new(ReceiveContext {
            broker: self.broker.clone(),
            subscription: self.name.clone(),
            stream: stream.clone(),
            config_key: self.config_key.clone(),
            retry_key: self.retry_key.clone(),
            in_flight: Mutex::new(HashMap::new()),
            ordering: Mutex::new(OrderingGate::default()),
        });
        let group = self.name.clone();
        self.broker
            .blocking(move |conn| ensure_group(conn, &stream, &group, "$"))
            .await?;

        let permits = Arc::new(Semaphore::new(settings.max_outstanding_messages.max(1)));
        let mut in_flight = JoinSet::new();

        let result = loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = self.broker.closed.cancelled() => break Err(BrokerError::Closed),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(BrokerError::Closed),
                },
            };
            if cancel.is_cancelled() {
                break Ok(());
            }

            let count = (permits.available_permits() + 1).min(MAX_BATCH);
            let mut deliveries = context.take_ready(count);
            if deliveries.is_empty() {
                let poller = context.clone();
                let polled = self
                    .broker
                    .blocking(move |conn| poller.poll(conn, count))
                    .await;
                deliveries = match polled {
                    Ok(deliveries) => deliveries,
                    Err(BrokerError::Closed) if cancel.is_cancelled() => break Ok(()),
                    Err(err) => break Err(err),
                };
            }

            let mut first = Some(first);
            for delivery in deliveries {
                let Some(delivery) = context.admit(delivery) else {
                    continue;
                };
                let permit = match first.take() {
                    Some(permit) => permit,
                    None => match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let entry = delivery.entry.clone();
                let attempts = delivery.attempts;
                context
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(entry.id.clone(), delivery);

                let acker: Arc<dyn Acknowledger> = Arc::new(RedisAcker {
                    context: context.clone(),
                });
                let mut message =
                    ReceivedMessage::new(entry.id.clone(), entry.data, entry.id, acker);
                message.attributes = entry.attributes;
                message.publish_time = entry.publish_time;
                message.ordering_key = entry.ordering_key;
                message.delivery_attempt = Some(attempts);

                let handler = handler.clone();
                let ctx = cancel.clone();
                in_flight.spawn(async move {
                    handler.handle(ctx, message).await;
                    drop(permit);
                });
            }

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
