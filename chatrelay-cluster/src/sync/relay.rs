//! Cross-process message relay
//!
//! Every process publishes the messages its sessions produce and consumes
//! every message published by any process (itself included). Each consumer
//! asks its local registry for the recipients; only the process holding a
//! recipient's connection enqueues anything.

use chatrelay_core::models::OutboundMessage;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::dedup::MessageDeduplicator;
use super::events::RelayEnvelope;
use super::outbound::OutboundFrame;
use super::registry::{ConnectionRegistry, DeliveryOutcome};
use crate::error::{Error, Result};

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayBusConfig {
    /// Unique identifier for this process
    pub node_id: String,
    /// Broker topic carrying relay envelopes
    pub topic: String,
    /// Deduplication window duration
    pub dedup_window: Duration,
    /// How often to cleanup dedup entries
    pub cleanup_interval: Duration,
    /// Messages buffered for the publisher task; excess is dropped
    pub publish_channel_capacity: usize,
}

impl Default for RelayBusConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node_{}", nanoid::nanoid!(8)),
            topic: "chatrelay:messages".to_string(),
            dedup_window: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(30),
            publish_channel_capacity: 10_000,
        }
    }
}

impl RelayBusConfig {
    #[must_use]
    pub fn from_config(config: &chatrelay_core::Config, node_id: String) -> Self {
        Self {
            node_id,
            topic: config.redis.channel.clone(),
            dedup_window: Duration::from_secs(config.relay.dedup_window_seconds),
            cleanup_interval: Duration::from_secs(config.relay.cleanup_interval_seconds),
            publish_channel_capacity: config.relay.publish_channel_capacity,
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    publish_dropped: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    decode_failures: AtomicU64,
    delivered: AtomicU64,
}

/// Relay metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub publish_dropped: u64,
    pub received: u64,
    pub duplicates: u64,
    pub decode_failures: u64,
    pub delivered: u64,
}

pub struct RelayBus {
    broker: Arc<dyn Broker>,
    registry: ConnectionRegistry,
    deduplicator: MessageDeduplicator,
    publish_tx: mpsc::Sender<OutboundMessage>,
    node_id: String,
    topic: String,
    subscribed: AtomicBool,
    counters: Arc<Counters>,
    cancel_token: CancellationToken,
}

impl RelayBus {
    /// Create the relay and spawn its publisher and dedup cleanup tasks
    ///
    /// Must be called inside a Tokio runtime. Call [`RelayBus::start_subscriber`]
    /// to begin consuming.
    pub fn new(
        config: RelayBusConfig,
        broker: Arc<dyn Broker>,
        registry: ConnectionRegistry,
    ) -> Arc<Self> {
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_channel_capacity.max(1));
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let deduplicator = MessageDeduplicator::new(config.dedup_window);
        deduplicator.spawn_cleanup(config.cleanup_interval, cancel_token.child_token());

        tokio::spawn(run_publisher(
            publish_rx,
            broker.clone(),
            config.node_id.clone(),
            config.topic.clone(),
            counters.clone(),
            cancel_token.child_token(),
        ));

        info!(node_id = %config.node_id, topic = %config.topic, "Relay bus created");

        Arc::new(Self {
            broker,
            registry,
            deduplicator,
            publish_tx,
            node_id: config.node_id,
            topic: config.topic,
            subscribed: AtomicBool::new(false),
            counters,
            cancel_token,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fire-and-forget publish; never blocks the caller
    ///
    /// Returns an error only when the message could not even be queued for
    /// the publisher (buffer full or relay shut down). Broker failures are
    /// logged by the publisher task.
    pub fn publish(&self, message: OutboundMessage) -> Result<()> {
        let message_id = message.id.clone();
        match self.publish_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message_id, "Relay publish buffer full, message dropped");
                Err(Error::BrokerPublish("publish buffer full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.publish_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message_id, "Relay publisher stopped, message dropped");
                Err(Error::BrokerPublish("relay shut down".to_string()))
            }
        }
    }

    /// Subscribe to the relay topic and spawn the consumer task
    ///
    /// One consumer per process; later calls are no-ops.
    pub async fn start_subscriber(self: &Arc<Self>) -> Result<()> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            debug!("Relay subscriber already running");
            return Ok(());
        }

        let stream = match self.broker.subscribe(&self.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(Error::BrokerSubscribe(e.to_string()));
            }
        };

        let relay = Arc::clone(self);
        tokio::spawn(async move { relay.consume(stream).await });

        info!(node_id = %self.node_id, topic = %self.topic, "Relay subscriber started");
        Ok(())
    }

    async fn consume(self: Arc<Self>, mut stream: BoxStream<'static, Vec<u8>>) {
        loop {
            let payload = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Relay subscriber cancelled");
                    return;
                }
                payload = stream.next() => payload,
            };

            let Some(payload) = payload else {
                error!(topic = %self.topic, "Relay subscription ended");
                return;
            };
            self.dispatch(&payload);
        }
    }

    /// Deliver one broker payload to the locally connected recipients
    ///
    /// Returns how many recipients had the message enqueued on this process.
    pub fn dispatch(&self, payload: &[u8]) -> usize {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let envelope = match RelayEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = payload.len(), "Skipping undecodable relay payload");
                return 0;
            }
        };

        if !self.deduplicator.should_process(&envelope.message.id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(message_id = %envelope.message.id, "Skipping duplicate relay message");
            return 0;
        }

        let message = Arc::new(envelope.message);
        let mut delivered = 0;
        for recipient in &message.recipients {
            match self
                .registry
                .deliver(recipient, OutboundFrame::Message(message.clone()))
            {
                DeliveryOutcome::Delivered => delivered += 1,
                DeliveryOutcome::NotConnected => {}
                DeliveryOutcome::QueueFull => {
                    warn!(
                        message_id = %message.id,
                        recipient = %recipient,
                        "Relay delivery dropped, recipient queue full"
                    );
                }
                DeliveryOutcome::Closed => {
                    debug!(
                        message_id = %message.id,
                        recipient = %recipient,
                        "Relay delivery skipped, connection closing"
                    );
                }
            }
        }

        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(
            message_id = %message.id,
            origin = %envelope.node_id,
            payload_type = message.payload.payload_type(),
            recipients = message.recipients.len(),
            delivered,
            "Relay message dispatched"
        );
        delivered
    }

    /// Stop publisher, subscriber and cleanup tasks, then the broker's own
    pub fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down relay bus");
        self.cancel_token.cancel();
        self.broker.shutdown();
    }

    #[must_use]
    pub fn metrics(&self) -> RelayMetrics {
        let c = &self.counters;
        RelayMetrics {
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            publish_dropped: c.publish_dropped.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
        }
    }
}

async fn run_publisher(
    mut publish_rx: mpsc::Receiver<OutboundMessage>,
    broker: Arc<dyn Broker>,
    node_id: String,
    topic: String,
    counters: Arc<Counters>,
    cancel_token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Relay publisher task cancelled");
                return;
            }
            message = publish_rx.recv() => message,
        };
        let Some(message) = message else {
            debug!("Relay publish channel closed, exiting");
            return;
        };

        let message_id = message.id.clone();
        let payload = match RelayEnvelope::new(node_id.clone(), message).encode() {
            Ok(payload) => payload,
            Err(e) => {
                counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, message_id = %message_id, "Failed to encode relay envelope");
                continue;
            }
        };

        match broker.publish(&topic, payload).await {
            Ok(subscribers) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(message_id = %message_id, subscribers, "Relay message published");
            }
            Err(e) => {
                counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, message_id = %message_id, "Relay publish failed");
            }
        }
    }
}
