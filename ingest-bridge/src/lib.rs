pub mod bus;
pub mod config;
pub mod consumer;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod sink;

pub use crate::bus::{BrokerWatch, BusError, BusSource, Delivery, KafkaSource, Position, Record};
pub use crate::config::{BridgeConfig, OffsetReset};
pub use crate::consumer::{Batch, BatchConsumer, BatchSettings, ConsumerState, FlushOutcome};
pub use crate::health::HealthServer;
pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use crate::sink::{AnalyticsSink, ClickHouseSink, RetryPolicy, SinkConfig, SinkError};
