pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    Broker, ConnectionHandle, ConnectionRegistry, DeliveryOutcome, FrameSink, InMemoryBroker,
    OutboundFrame, OutboundQueue, RedisBroker, RelayBus, RelayBusConfig,
};
