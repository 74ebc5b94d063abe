//! Publish/subscribe transport underneath the relay

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::error::Result;

/// External fan-out broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `topic`, returning the number of live subscribers
    /// that received it (best effort; brokers may report 0 when unknown)
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize>;

    /// Live sequence of payloads published on `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Stop background tasks owned by the broker; open streams end
    fn shutdown(&self) {}
}

/// Default per-topic buffer of the in-memory broker
pub const IN_MEMORY_TOPIC_CAPACITY: usize = 4096;

/// In-process broker built on `tokio::sync::broadcast`
///
/// Serves single-node deployments; several relay buses sharing one instance
/// behave like separate processes sharing Redis.
pub struct InMemoryBroker {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
    capacity: usize,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(IN_MEMORY_TOPIC_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        // No subscribers is not an error for a fan-out bus
        Ok(self.sender(topic).send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = futures::stream::unfold(
            (receiver, topic),
            |(mut receiver, topic)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, (receiver, topic))),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Relay subscriber lagged, messages skipped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}
