//! Error types for the connection hub and relay

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Outbound queue at capacity; the frame was dropped
    #[error("Outbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Writer side of the connection is gone
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker publish failed: {0}")]
    BrokerPublish(String),

    #[error("Broker subscribe failed: {0}")]
    BrokerSubscribe(String),

    #[error("Broker payload could not be decoded: {0}")]
    BrokerDecode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
