pub mod model;
pub mod producer;
pub mod wire;

pub use model::{EventCategory, EventEnvelope, EventType, GovernanceEvent, PublishError, PublishResult, Severity, DEFAULT_PARTITION_KEY};
pub use producer::{BusTransport, MemoryBus, PublishedRecord, Publisher, PublisherConfig, TransportConnector};
pub use wire::{decode, encode, normalize_for_sink, normalize_timestamp, parse_event_time, DecodeError, SINK_TIME_FORMAT};
#[cfg(feature = "kafka")]
pub use producer::KafkaConnector;
