use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Buffered payloads between the subscriber task and the relay consumer
const SUBSCRIBER_BUFFER: usize = 1024;

/// Maximum number of catch-up iterations per reconnection
const MAX_CATCHUP_ITERATIONS: usize = 10;

/// Number of entries read per XREAD call during catch-up
const CATCHUP_BATCH_SIZE: usize = 1000;

/// Catch-up starts this far before the observed disconnect; replayed
/// duplicates are dropped by the relay deduplicator
const CATCHUP_OVERLAP_MS: i64 = 2_000;

/// Companion stream key holding recent payloads of `topic`
fn stream_key(topic: &str) -> String {
    format!("{topic}:stream")
}

/// Redis broker: PUBLISH for live fan-out plus XADD to a capped stream so a
/// reconnecting subscriber can replay what it missed
pub struct RedisBroker {
    client: RedisClient,
    stream_max_len: usize,
    publish_conn: Mutex<Option<MultiplexedConnection>>,
    cancel_token: CancellationToken,
}

impl RedisBroker {
    pub fn new(redis_url: &str, stream_max_len: usize) -> anyhow::Result<Self> {
        let client = RedisClient::open(redis_url).context("Failed to create Redis client")?;

        Ok(Self {
            client,
            stream_max_len,
            publish_conn: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut cached = self.publish_conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("connecting to Redis for publishing".to_string()))??;

        info!("Redis publisher connection established");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        self.publish_conn.lock().await.take();
    }

    async fn publish_with(
        &self,
        conn: &mut MultiplexedConnection,
        topic: &str,
        payload: &[u8],
    ) -> Result<usize> {
        // Catch-up copy first; losing it only weakens reconnection replay
        let stream_result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.xadd_maxlen::<_, _, _, _, String>(
                stream_key(topic),
                StreamMaxlen::Approx(self.stream_max_len),
                "*",
                &[("payload", payload)],
            ),
        )
        .await;
        match stream_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, topic, "Failed to append to catch-up stream (non-critical)"),
            Err(_) => warn!(topic, "Timed out appending to catch-up stream (non-critical)"),
        }

        let subscribers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(topic, payload),
        )
        .await
        .map_err(|_| Error::Timeout("publishing to Redis".to_string()))??;

        Ok(subscribers)
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| Error::BrokerPublish(e.to_string()))?;

        match self.publish_with(&mut conn, topic, &payload).await {
            Ok(subscribers) => Ok(subscribers),
            Err(e) => {
                // Reconnect on the next publish
                self.reset_connection().await;
                Err(Error::BrokerPublish(e.to_string()))
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let worker = SubscriberWorker {
            client: self.client.clone(),
            topic: topic.to_string(),
            stream_key: stream_key(topic),
            cancel_token: self.cancel_token.child_token(),
            tx,
        };
        tokio::spawn(worker.run());

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Stop every subscriber task started by this broker
    fn shutdown(&self) {
        info!("Shutting down Redis broker");
        self.cancel_token.cancel();
    }
}

/// Describes how one subscription attempt ended, enabling proper backoff behavior
enum SubscriberExit {
    /// Subscription was live and then the connection dropped; backoff resets
    Disconnected,
    /// Could not connect or subscribe; backoff keeps growing
    ConnectFailed(anyhow::Error),
    /// Cancelled, or the consumer went away
    Stopped,
}

/// Long-lived subscription task with reconnection and catch-up
struct SubscriberWorker {
    client: RedisClient,
    topic: String,
    stream_key: String,
    cancel_token: CancellationToken,
    tx: mpsc::Sender<Vec<u8>>,
}

impl SubscriberWorker {
    async fn run(self) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        // Stream id to replay from after a reconnection
        let mut resume_from: Option<String> = None;

        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }

            match self.run_once(&mut resume_from).await {
                SubscriberExit::Stopped => break,
                SubscriberExit::Disconnected => {
                    error!(
                        topic = %self.topic,
                        "Redis subscriber connection lost, reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    if resume_from.is_none() {
                        let since = chrono::Utc::now().timestamp_millis() - CATCHUP_OVERLAP_MS;
                        resume_from = Some(format!("{}-0", since.max(0)));
                    }
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        error = %e,
                        topic = %self.topic,
                        backoff_secs,
                        "Redis subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }

        info!(topic = %self.topic, "Redis subscriber task stopped");
    }

    async fn run_once(&self, resume_from: &mut Option<String>) -> SubscriberExit {
        let mut pubsub = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await
        {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("Failed to get Redis Pub/Sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out getting Redis Pub/Sub connection"
                ));
            }
        };

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.topic),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context(format!("Failed to subscribe to {}", self.topic)),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "Timed out subscribing to {}",
                    self.topic
                ));
            }
        }

        info!(topic = %self.topic, "Redis subscriber connected");

        // Subscribed before replaying, so nothing falls between catch-up and live
        if let Some(cursor) = resume_from.as_deref() {
            match self.read_missed(cursor).await {
                Ok(missed) => {
                    if !missed.is_empty() {
                        info!(
                            count = missed.len(),
                            from_id = %cursor,
                            "Catching up on relay messages missed while disconnected"
                        );
                    }
                    for payload in missed {
                        if self.tx.send(payload).await.is_err() {
                            return SubscriberExit::Stopped;
                        }
                    }
                    *resume_from = None;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Failed to read catch-up stream, continuing with live messages"
                    );
                }
            }
        }

        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                () = self.cancel_token.cancelled() => return SubscriberExit::Stopped,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            let payload: Vec<u8> = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, topic = %self.topic, "Invalid Redis payload");
                    continue;
                }
            };
            if self.tx.send(payload).await.is_err() {
                debug!(topic = %self.topic, "Relay consumer dropped, stopping subscriber");
                return SubscriberExit::Stopped;
            }
        }
    }

    /// Read entries appended to the catch-up stream after `last_id`
    async fn read_missed(&self, last_id: &str) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection for catch-up")?;

        let mut payloads = Vec::new();
        let mut cursor = last_id.to_string();

        for iteration in 0..MAX_CATCHUP_ITERATIONS {
            let reply: StreamReadReply = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                conn.xread_options(
                    &[self.stream_key.as_str()],
                    &[cursor.as_str()],
                    &StreamReadOptions::default().count(CATCHUP_BATCH_SIZE),
                ),
            )
            .await
            .context("Timed out reading catch-up stream")?
            .context("Failed to read catch-up stream")?;

            let mut batch_count = 0;
            for stream in reply.keys {
                for entry in stream.ids {
                    batch_count += 1;
                    if let Some(payload) = entry.get::<Vec<u8>>("payload") {
                        payloads.push(payload);
                    }
                    cursor = entry.id;
                }
            }

            if batch_count < CATCHUP_BATCH_SIZE {
                break;
            }
            if iteration == MAX_CATCHUP_ITERATIONS - 1 {
                warn!(
                    total = payloads.len(),
                    "Catch-up reached max iterations ({MAX_CATCHUP_ITERATIONS}), older messages skipped"
                );
            }
        }

        Ok(payloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key() {
        assert_eq!(stream_key("chatrelay:messages"), "chatrelay:messages:stream");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisBroker::new("not a url", 100).is_err());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_publish_reaches_subscriber() {
        let broker = RedisBroker::new("redis://127.0.0.1:6379", 1000).unwrap();
        let mut stream = broker.subscribe("chatrelay:test").await.unwrap();

        // Give the subscriber task time to connect
        tokio::time::sleep(Duration::from_millis(500)).await;
        let receivers = broker
            .publish("chatrelay:test", b"hello".to_vec())
            .await
            .unwrap();
        assert!(receivers >= 1);

        let payload = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"hello".to_vec());

        broker.shutdown();
    }
}
