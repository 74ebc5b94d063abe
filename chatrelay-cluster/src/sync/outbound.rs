//! Per-connection bounded outbound queue and its writer task
//!
//! Producers (the bridge, the relay subscriber) never block: a full queue
//! drops the frame. A single writer task per connection drains the queue into
//! the transport, so write order is enqueue order.

use async_trait::async_trait;
use chatrelay_core::models::{OutboundMessage, Principal};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default number of frames buffered per connection
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default bound on a single transport write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keepalive interval
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(54);

/// Item carried by an outbound queue
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Sent once after successful authentication
    Ready {
        principal: Principal,
        connection_id: String,
    },
    Message(Arc<OutboundMessage>),
    Error {
        code: &'static str,
        message: String,
    },
}

impl OutboundFrame {
    #[must_use]
    pub fn message(message: OutboundMessage) -> Self {
        Self::Message(Arc::new(message))
    }

    #[must_use]
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn frame_type(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Message(_) => "message",
            Self::Error { .. } => "error",
        }
    }
}

/// Producer side of a connection's bounded outbound buffer
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: mpsc::Sender<OutboundFrame>,
    capacity: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, receiver)
    }

    /// Non-blocking enqueue; drops the frame when the queue is full
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Write half of a client transport, owned by the writer task
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<()>;

    /// Transport-level liveness probe (WebSocket ping)
    async fn keepalive(&mut self) -> Result<()> {
        Ok(())
    }

    /// Best-effort close; errors are irrelevant at this point
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub keepalive: Duration,
    pub write_timeout: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            keepalive: DEFAULT_KEEPALIVE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Why a writer task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    /// Shutdown signal observed (eviction, session end, process shutdown)
    Shutdown,
    /// Every producer dropped and the queue drained
    QueueClosed,
    WriteFailed(String),
}

/// Drain `queue` into `sink` until shutdown, queue closure, or a write failure
///
/// A write failure (or timeout) cancels `shutdown` so the rest of the session
/// observes the dead connection.
pub async fn run_writer<S: FrameSink>(
    mut queue: mpsc::Receiver<OutboundFrame>,
    mut sink: S,
    shutdown: CancellationToken,
    settings: WriterSettings,
) -> WriterExit {
    let mut keepalive = interval_at(Instant::now() + settings.keepalive, settings.keepalive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            () = shutdown.cancelled() => break WriterExit::Shutdown,

            frame = queue.recv() => {
                let Some(frame) = frame else {
                    break WriterExit::QueueClosed;
                };
                let frame_type = frame.frame_type();
                if let Err(e) = bounded_write(settings.write_timeout, sink.send(&frame)).await {
                    warn!(frame_type, error = %e, "Outbound write failed");
                    break WriterExit::WriteFailed(e.to_string());
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = bounded_write(settings.write_timeout, sink.keepalive()).await {
                    warn!(error = %e, "Keepalive failed");
                    break WriterExit::WriteFailed(e.to_string());
                }
            }
        }
    };

    if matches!(exit, WriterExit::WriteFailed(_)) {
        shutdown.cancel();
    }
    sink.close().await;

    debug!(exit = ?exit, "Writer stopped");
    exit
}

async fn bounded_write<F>(limit: Duration, write: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("write exceeded {limit:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::models::MessagePayload;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkEvent {
        Frame(String),
        Keepalive,
        Closed,
    }

    /// Records writes; fails every write after `fail_after` frames
    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<SinkEvent>>>,
        fail_after: Option<usize>,
        stall: bool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().clone()
        }

        fn frames(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SinkEvent::Frame(f) => Some(f),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&mut self, frame: &OutboundFrame) -> Result<()> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            let written = self.frames().len();
            if self.fail_after.is_some_and(|limit| written >= limit) {
                return Err(Error::Transport("broken pipe".to_string()));
            }
            let label = match frame {
                OutboundFrame::Error { message, .. } => message.clone(),
                other => other.frame_type().to_string(),
            };
            self.events.lock().push(SinkEvent::Frame(label));
            Ok(())
        }

        async fn keepalive(&mut self) -> Result<()> {
            self.events.lock().push(SinkEvent::Keepalive);
            Ok(())
        }

        async fn close(&mut self) {
            self.events.lock().push(SinkEvent::Closed);
        }
    }

    fn numbered(n: usize) -> OutboundFrame {
        OutboundFrame::error("TEST", n.to_string())
    }

    #[test]
    fn test_full_queue_rejects_without_growing() {
        let (queue, _rx) = OutboundQueue::bounded(2);

        queue.enqueue(numbered(1)).unwrap();
        queue.enqueue(numbered(2)).unwrap();
        let err = queue.enqueue(numbered(3)).unwrap_err();

        assert!(matches!(err, Error::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_closed_queue_reports_connection_closed() {
        let (queue, rx) = OutboundQueue::bounded(4);
        drop(rx);

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(numbered(1)),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (queue, _rx) = OutboundQueue::bounded(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.enqueue(numbered(1)).is_ok());
    }

    #[tokio::test]
    async fn test_write_order_matches_enqueue_order() {
        let (queue, rx) = OutboundQueue::bounded(1024);
        let enqueued = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            let enqueued = enqueued.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let label = format!("{p}-{i}");
                    {
                        // Hold the log lock across enqueue so log order is queue order
                        let mut log = enqueued.lock();
                        queue.enqueue(OutboundFrame::error("TEST", label.clone())).unwrap();
                        log.push(label);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        drop(queue);

        let sink = RecordingSink::default();
        let exit = run_writer(rx, sink.clone(), CancellationToken::new(), WriterSettings::default()).await;

        assert_eq!(exit, WriterExit::QueueClosed);
        assert_eq!(sink.frames(), *enqueued.lock());
        assert_eq!(sink.events().last(), Some(&SinkEvent::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sink() {
        let (queue, rx) = OutboundQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let sink = RecordingSink::default();

        let writer = tokio::spawn(run_writer(
            rx,
            sink.clone(),
            shutdown.clone(),
            WriterSettings::default(),
        ));
        queue.enqueue(numbered(1)).unwrap();
        tokio::task::yield_now().await;
        shutdown.cancel();

        assert_eq!(writer.await.unwrap(), WriterExit::Shutdown);
        assert_eq!(sink.events().last(), Some(&SinkEvent::Closed));
        // Queue still has an open producer; the writer stopped anyway
        drop(queue);
    }

    #[tokio::test]
    async fn test_write_failure_cancels_session() {
        let (queue, rx) = OutboundQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let sink = RecordingSink {
            fail_after: Some(1),
            ..RecordingSink::default()
        };

        queue.enqueue(numbered(1)).unwrap();
        queue.enqueue(numbered(2)).unwrap();
        let exit = run_writer(rx, sink.clone(), shutdown.clone(), WriterSettings::default()).await;

        assert!(matches!(exit, WriterExit::WriteFailed(_)));
        assert!(shutdown.is_cancelled());
        assert_eq!(sink.frames(), vec!["1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (queue, rx) = OutboundQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let sink = RecordingSink {
            stall: true,
            ..RecordingSink::default()
        };

        queue
            .enqueue(OutboundFrame::message(OutboundMessage::new(
                "alice".into(),
                vec!["bob".into()],
                MessagePayload::Typing {
                    conversation_id: "c".into(),
                    is_typing: true,
                },
            )))
            .unwrap();
        let settings = WriterSettings {
            keepalive: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(10),
        };
        let exit = run_writer(rx, sink, shutdown.clone(), settings).await;

        assert!(matches!(exit, WriterExit::WriteFailed(msg) if msg.contains("exceeded")));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fires_when_idle() {
        let (queue, rx) = OutboundQueue::bounded(8);
        let shutdown = CancellationToken::new();
        let sink = RecordingSink::default();
        let settings = WriterSettings {
            keepalive: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        };

        let writer = tokio::spawn(run_writer(rx, sink.clone(), shutdown.clone(), settings));
        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown.cancel();
        writer.await.unwrap();
        drop(queue);

        let keepalives = sink
            .events()
            .iter()
            .filter(|e| **e == SinkEvent::Keepalive)
            .count();
        assert_eq!(keepalives, 3);
    }
}
