use crate::model::{EventEnvelope, GovernanceEvent, PublishError, PublishResult};
use crate::wire;
use chrono::Utc;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A live producer connection. `send` only enqueues; delivery happens on `poll`/`flush`.
pub trait BusTransport: Send + Sync {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> PublishResult<()>;
    fn poll(&self);
    fn flush(&self, timeout: Duration) -> PublishResult<()>;
}

/// Opens a [`BusTransport`]. Called lazily by the [`Publisher`] on first use.
pub trait TransportConnector: Send + Sync {
    fn connect(&self) -> PublishResult<Arc<dyn BusTransport>>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub category_topic_prefix: String,
    pub linger_ms: u64,
    pub batch_bytes: u64,
    pub batch_messages: u64,
    pub compression: String,
    pub acks: String,
    pub message_timeout_ms: u64,
    pub connect_timeout: Duration,
    pub reconnect_cooldown: Duration,
    pub flush_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: "governance.events".to_string(),
            category_topic_prefix: "governance.events.".to_string(),
            linger_ms: 5,
            batch_bytes: 1_048_576,
            batch_messages: 10_000,
            compression: "lz4".to_string(),
            acks: "all".to_string(),
            message_timeout_ms: 30_000,
            connect_timeout: Duration::from_millis(3_000),
            reconnect_cooldown: Duration::from_secs(30),
            flush_timeout: Duration::from_millis(5_000),
        }
    }
}

impl PublisherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bootstrap_servers: env::var("KAFKA_BOOTSTRAP").unwrap_or(defaults.bootstrap_servers),
            topic: env::var("GOVERNANCE_TOPIC").unwrap_or(defaults.topic),
            category_topic_prefix: env::var("GOVERNANCE_CATEGORY_TOPIC_PREFIX")
                .unwrap_or(defaults.category_topic_prefix),
            linger_ms: u64_from_env("KAFKA_LINGER_MS").unwrap_or(defaults.linger_ms),
            batch_bytes: u64_from_env("KAFKA_BATCH_BYTES").unwrap_or(defaults.batch_bytes).max(1),
            batch_messages: u64_from_env("KAFKA_BATCH_MESSAGES").unwrap_or(defaults.batch_messages).max(1),
            compression: env::var("KAFKA_COMPRESSION").unwrap_or(defaults.compression),
            acks: env::var("KAFKA_ACKS").unwrap_or(defaults.acks),
            message_timeout_ms: u64_from_env("KAFKA_MESSAGE_TIMEOUT_MS").unwrap_or(defaults.message_timeout_ms),
            connect_timeout: u64_from_env("PUBLISHER_CONNECT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            reconnect_cooldown: u64_from_env("PUBLISHER_RECONNECT_COOLDOWN_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_cooldown),
            flush_timeout: u64_from_env("PUBLISHER_FLUSH_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_timeout),
        }
    }

    /// Fan-out topic for a category, or `None` when it would duplicate the primary topic.
    pub fn category_topic(&self, category: &str) -> Option<String> {
        let category = category.trim().to_ascii_lowercase();
        if category.is_empty() || self.category_topic_prefix.is_empty() {
            return None;
        }
        let topic = format!("{}{}", self.category_topic_prefix, category);
        if topic == self.topic { None } else { Some(topic) }
    }
}

fn u64_from_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}

enum Connection {
    Idle,
    /// One caller is connecting outside the lock; everyone else skips.
    Connecting,
    Ready(Arc<dyn BusTransport>),
    Failed { at: Instant, reason: String },
}

/// Best-effort producer for governance events.
///
/// The first call connects. A failed connect is cached for `reconnect_cooldown` so a
/// degraded bus is not hammered by every request; callers just get `None` meanwhile.
pub struct Publisher {
    connector: Box<dyn TransportConnector>,
    config: PublisherConfig,
    state: Mutex<Connection>,
}

impl Publisher {
    pub fn new(connector: impl TransportConnector + 'static, config: PublisherConfig) -> Self {
        Self { connector: Box::new(connector), config, state: Mutex::new(Connection::Idle) }
    }

    pub fn config(&self) -> &PublisherConfig { &self.config }

    pub fn publish_event(&self, event: GovernanceEvent) -> Option<String> {
        self.publish(event.into_envelope(Uuid::new_v4(), Utc::now()))
    }

    /// Returns the event id once the primary topic accepted the record, `None` otherwise.
    pub fn publish(&self, event: EventEnvelope) -> Option<String> {
        let Some(transport) = self.transport() else {
            warn!(event_id = %event.event_id, event_type = %event.event_type, "bus unavailable; governance event not published");
            return None;
        };
        let payload = match wire::encode(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, event_id = %event.event_id, "failed to serialize governance event");
                return None;
            }
        };
        let key = event.partition_key();
        if let Err(err) = transport.send(&self.config.topic, key, &payload) {
            warn!(error = %err, topic = %self.config.topic, event_id = %event.event_id, "failed to enqueue governance event");
            return None;
        }
        if let Some(category_topic) = self.config.category_topic(&event.event_category) {
            if let Err(err) = transport.send(&category_topic, key, &payload) {
                warn!(error = %err, topic = %category_topic, event_id = %event.event_id, "category fan-out failed");
            }
        }
        transport.poll();
        debug!(event_id = %event.event_id, event_type = %event.event_type, key, "governance event enqueued");
        Some(event.event_id)
    }

    /// Drives delivery callbacks without blocking.
    pub fn poll(&self) {
        if let Some(transport) = self.ready_transport() {
            transport.poll();
        }
    }

    /// Bounded wait for outstanding deliveries; call before shutdown.
    pub fn flush(&self) -> PublishResult<()> {
        let Some(transport) = self.ready_transport() else {
            return Ok(());
        };
        transport.flush(self.config.flush_timeout)?;
        info!(timeout_ms = self.config.flush_timeout.as_millis() as u64, "publisher flushed");
        Ok(())
    }

    pub fn is_degraded(&self) -> bool {
        matches!(*self.lock_state(), Connection::Failed { .. })
    }

    /// Forgets a cached failure so the next publish reconnects immediately.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        if matches!(*state, Connection::Failed { .. }) {
            *state = Connection::Idle;
        }
    }

    fn ready_transport(&self) -> Option<Arc<dyn BusTransport>> {
        match &*self.lock_state() {
            Connection::Ready(transport) => Some(transport.clone()),
            _ => None,
        }
    }

    fn transport(&self) -> Option<Arc<dyn BusTransport>> {
        {
            let mut state = self.lock_state();
            match &*state {
                Connection::Ready(transport) => return Some(transport.clone()),
                Connection::Connecting => {
                    debug!("publisher connect in progress; skipping");
                    return None;
                }
                Connection::Failed { at, reason } if at.elapsed() < self.config.reconnect_cooldown => {
                    debug!(reason = %reason, "publisher degraded; skipping reconnect");
                    return None;
                }
                _ => {}
            }
            *state = Connection::Connecting;
        }
        let result = self.connector.connect();
        let mut state = self.lock_state();
        match result {
            Ok(transport) => {
                info!(bootstrap = %self.config.bootstrap_servers, topic = %self.config.topic, "publisher connected");
                *state = Connection::Ready(transport.clone());
                Some(transport)
            }
            Err(err) => {
                error!(error = %err, bootstrap = %self.config.bootstrap_servers, "publisher connect failed");
                *state = Connection::Failed { at: Instant::now(), reason: err.to_string() };
                None
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the state itself consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// In-process bus used for local runs without a broker and by tests.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

struct MemoryBusInner {
    records: Mutex<Vec<PublishedRecord>>,
    available: AtomicBool,
    connects: AtomicUsize,
    flushes: AtomicUsize,
}

impl Default for MemoryBus {
    fn default() -> Self { Self::new() }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryBusInner {
                records: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                flushes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_available(&self, available: bool) { self.inner.available.store(available, Ordering::SeqCst); }
    pub fn connect_attempts(&self) -> usize { self.inner.connects.load(Ordering::SeqCst) }
    pub fn flushes(&self) -> usize { self.inner.flushes.load(Ordering::SeqCst) }

    pub fn records(&self) -> Vec<PublishedRecord> {
        self.inner.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn topic_records(&self, topic: &str) -> Vec<PublishedRecord> {
        self.records().into_iter().filter(|r| r.topic == topic).collect()
    }

    fn is_available(&self) -> bool { self.inner.available.load(Ordering::SeqCst) }
}

impl TransportConnector for MemoryBus {
    fn connect(&self) -> PublishResult<Arc<dyn BusTransport>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Err(PublishError::Unavailable("memory bus offline".into()));
        }
        Ok(Arc::new(self.clone()))
    }
}

impl BusTransport for MemoryBus {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> PublishResult<()> {
        if !self.is_available() {
            return Err(PublishError::Unavailable("memory bus offline".into()));
        }
        let mut records = self.inner.records.lock().map_err(|_| PublishError::Unavailable("memory bus poisoned".into()))?;
        records.push(PublishedRecord { topic: topic.to_string(), key: key.to_string(), payload: payload.to_vec() });
        Ok(())
    }

    fn poll(&self) {}

    fn flush(&self, _timeout: Duration) -> PublishResult<()> {
        self.inner.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaConnector;

#[cfg(feature = "kafka")]
mod kafka {
    use super::{BusTransport, PublisherConfig, TransportConnector};
    use crate::model::{PublishError, PublishResult};
    use rdkafka::message::Message;
    use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
    use rdkafka::{ClientConfig, ClientContext};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::warn;

    pub struct DeliveryLogger;

    impl ClientContext for DeliveryLogger {}

    impl ProducerContext for DeliveryLogger {
        type DeliveryOpaque = ();

        fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
            if let Err((err, msg)) = result {
                warn!(error = %err, topic = msg.topic(), partition = msg.partition(), "governance event delivery failed");
            }
        }
    }

    struct KafkaTransport {
        producer: BaseProducer<DeliveryLogger>,
    }

    impl BusTransport for KafkaTransport {
        fn send(&self, topic: &str, key: &str, payload: &[u8]) -> PublishResult<()> {
            self.producer
                .send(BaseRecord::to(topic).key(key).payload(payload))
                .map_err(|(err, _)| PublishError::Kafka(err.to_string()))
        }

        fn poll(&self) {
            self.producer.poll(Duration::ZERO);
        }

        fn flush(&self, timeout: Duration) -> PublishResult<()> {
            self.producer.flush(timeout).map_err(|err| PublishError::Kafka(err.to_string()))
        }
    }

    /// Builds an rdkafka producer from [`PublisherConfig`] and verifies the cluster answers.
    pub struct KafkaConnector {
        config: PublisherConfig,
    }

    impl KafkaConnector {
        pub fn new(config: PublisherConfig) -> Self { Self { config } }
    }

    impl TransportConnector for KafkaConnector {
        fn connect(&self) -> PublishResult<Arc<dyn BusTransport>> {
            let cfg = &self.config;
            let producer: BaseProducer<DeliveryLogger> = ClientConfig::new()
                .set("bootstrap.servers", &cfg.bootstrap_servers)
                .set("linger.ms", cfg.linger_ms.to_string())
                .set("batch.size", cfg.batch_bytes.to_string())
                .set("batch.num.messages", cfg.batch_messages.to_string())
                .set("compression.type", &cfg.compression)
                .set("acks", &cfg.acks)
                .set("message.timeout.ms", cfg.message_timeout_ms.to_string())
                .create_with_context(DeliveryLogger)
                .map_err(|err| PublishError::Kafka(err.to_string()))?;
            producer
                .client()
                .fetch_metadata(None, cfg.connect_timeout)
                .map_err(|err| PublishError::Unavailable(err.to_string()))?;
            Ok(Arc::new(KafkaTransport { producer }))
        }
    }
}
