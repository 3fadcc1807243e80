use crate::config::BridgeConfig;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext, Offset, Statistics, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to create consumer: {0}")]
    Create(String),
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("offset commit failed: {0}")]
    Commit(String),
}

/// A point in one partition's log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Position {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self { topic: topic.into(), partition, offset }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub payload: Vec<u8>,
    pub position: Position,
}

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message(Record),
    Timeout,
    Error(String),
}

/// The consumer side of the bus. Offsets only move when `commit` is called.
#[async_trait]
pub trait BusSource: Send {
    async fn poll(&mut self, timeout: Duration) -> Delivery;

    /// Stores each position as the next offset the group reads from that partition.
    fn commit(&mut self, positions: &[Position]) -> Result<(), BusError>;

    fn close(&mut self);

    /// Whether the source currently believes a broker is reachable.
    fn is_connected(&self) -> bool { true }
}

/// Broker reachability as reported by librdkafka's error and statistics callbacks.
#[derive(Debug)]
pub struct BrokerWatch {
    up: AtomicBool,
}

impl BrokerWatch {
    fn new() -> Self { Self { up: AtomicBool::new(true) } }

    pub fn is_up(&self) -> bool { self.up.load(Ordering::SeqCst) }

    fn set(&self, up: bool) {
        if self.up.swap(up, Ordering::SeqCst) != up {
            info!(up, "broker reachability changed");
        }
    }
}

impl ClientContext for BrokerWatch {
    fn stats(&self, statistics: Statistics) {
        let up = statistics
            .brokers
            .values()
            .any(|broker| broker.state == "UP" && broker.source != "internal" && broker.source != "logical");
        self.set(up);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason, "kafka client error");
        if matches!(
            error.rdkafka_error_code(),
            Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure | RDKafkaErrorCode::Resolve)
        ) {
            self.set(false);
        }
    }
}

impl ConsumerContext for BrokerWatch {}

pub struct KafkaSource {
    consumer: StreamConsumer<BrokerWatch>,
    topic: String,
}

impl KafkaSource {
    /// Creates the consumer, confirms the cluster answers, and subscribes. Blocks on the
    /// metadata round trip, so async callers should run it on a blocking thread.
    pub fn connect(config: &BridgeConfig) -> Result<Self, BusError> {
        let consumer: StreamConsumer<BrokerWatch> = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_bootstrap)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", config.offset_reset.as_str())
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("statistics.interval.ms", "5000")
            .create_with_context(BrokerWatch::new())
            .map_err(|err| BusError::Create(err.to_string()))?;
        consumer
            .fetch_metadata(Some(config.topic.as_str()), Duration::from_secs(5))
            .map_err(|err| BusError::Unreachable(err.to_string()))?;
        consumer.subscribe(&[config.topic.as_str()]).map_err(|err| BusError::Subscribe {
            topic: config.topic.clone(),
            reason: err.to_string(),
        })?;
        info!(topic = %config.topic, group = %config.consumer_group, bootstrap = %config.kafka_bootstrap, "subscribed to governance topic");
        Ok(Self { consumer, topic: config.topic.clone() })
    }
}

#[async_trait]
impl BusSource for KafkaSource {
    async fn poll(&mut self, timeout: Duration) -> Delivery {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Delivery::Timeout,
            Ok(Ok(message)) => {
                self.consumer.context().set(true);
                Delivery::Message(Record {
                    payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    position: Position::new(message.topic(), message.partition(), message.offset()),
                })
            }
            Ok(Err(err)) => Delivery::Error(err.to_string()),
        }
    }

    fn commit(&mut self, positions: &[Position]) -> Result<(), BusError> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut offsets = TopicPartitionList::new();
        for position in positions {
            offsets
                .add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset))
                .map_err(|err| BusError::Commit(err.to_string()))?;
        }
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|err| BusError::Commit(err.to_string()))?;
        debug!(partitions = positions.len(), "offsets committed");
        Ok(())
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "unsubscribed from governance topic");
    }

    fn is_connected(&self) -> bool { self.consumer.context().is_up() }
}
