// Module: sync

pub mod broker;
pub mod dedup;
pub mod events;
pub mod outbound;
pub mod redis_broker;
pub mod registry;
pub mod relay;

pub use broker::{Broker, InMemoryBroker};
pub use dedup::MessageDeduplicator;
pub use events::RelayEnvelope;
pub use outbound::{
    run_writer, FrameSink, OutboundFrame, OutboundQueue, WriterExit, WriterSettings,
    DEFAULT_KEEPALIVE, DEFAULT_QUEUE_CAPACITY, DEFAULT_WRITE_TIMEOUT,
};
pub use redis_broker::RedisBroker;
pub use registry::{ConnectionHandle, ConnectionRegistry, DeliveryOutcome, RegistryMetrics};
pub use relay::{RelayBus, RelayBusConfig, RelayMetrics};
