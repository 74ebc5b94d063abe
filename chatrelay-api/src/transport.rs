//! Transport seams of the bridge
//!
//! A session needs an inbound [`FrameStream`] and an outbound
//! [`FrameSink`]. The WebSocket front-end implements both over an axum
//! socket; [`channel_transport`] implements them over in-process channels for
//! embedding and tests.

use async_trait::async_trait;
use chatrelay_cluster::{Error as ClusterError, FrameSink, OutboundFrame};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::{encode_server_frame, ClientFrame};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InboundError {
    /// One frame could not be decoded; the session continues
    #[error("{0}")]
    Decode(String),
    /// The transport itself failed; the session ends
    #[error("transport error: {0}")]
    Transport(String),
}

/// Read half of a client transport
#[async_trait]
pub trait FrameStream: Send {
    /// Next decoded frame, or `None` once the peer closed the connection
    async fn recv(&mut self) -> Option<Result<ClientFrame, InboundError>>;
}

/// What the client side of a channel transport observes
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A frame in its JSON wire form
    Frame(serde_json::Value),
    Keepalive,
    Closed,
}

pub struct ChannelStream {
    rx: mpsc::Receiver<Result<ClientFrame, InboundError>>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<ClientFrame, InboundError>> {
        self.rx.recv().await
    }
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: &OutboundFrame) -> chatrelay_cluster::Result<()> {
        let json: serde_json::Value = encode_server_frame(frame)
            .and_then(|text| serde_json::from_str(&text))
            .map_err(|e| ClusterError::Serialization(e.to_string()))?;
        self.tx
            .send(SinkEvent::Frame(json))
            .map_err(|_| ClusterError::Transport("client end dropped".to_string()))
    }

    async fn keepalive(&mut self) -> chatrelay_cluster::Result<()> {
        self.tx
            .send(SinkEvent::Keepalive)
            .map_err(|_| ClusterError::Transport("client end dropped".to_string()))
    }

    async fn close(&mut self) {
        let _ = self.tx.send(SinkEvent::Closed);
    }
}

/// Client side of a channel transport
pub struct ClientEnd {
    outbound: Option<mpsc::Sender<Result<ClientFrame, InboundError>>>,
    inbound: mpsc::UnboundedReceiver<SinkEvent>,
}

impl ClientEnd {
    /// Send a frame to the server; false once the session stopped reading
    pub async fn send(&self, frame: ClientFrame) -> bool {
        self.push(Ok(frame)).await
    }

    /// Inject a read-side failure as the transport would report it
    pub async fn send_error(&self, error: InboundError) -> bool {
        self.push(Err(error)).await
    }

    async fn push(&self, item: Result<ClientFrame, InboundError>) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(item).await.is_ok(),
            None => false,
        }
    }

    /// Next event written by the server
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        self.inbound.recv().await
    }

    /// Next frame written by the server, skipping keepalives
    pub async fn recv_frame(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.inbound.recv().await? {
                SinkEvent::Frame(frame) => return Some(frame),
                SinkEvent::Keepalive => {}
                SinkEvent::Closed => return None,
            }
        }
    }

    /// Half-close: the server sees end of stream
    pub fn close(&mut self) {
        self.outbound.take();
    }
}

/// In-process duplex transport buffering up to `capacity` client frames
#[must_use]
pub fn channel_transport(capacity: usize) -> (ClientEnd, ChannelStream, ChannelSink) {
    let (client_tx, server_rx) = mpsc::channel(capacity.max(1));
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    (
        ClientEnd {
            outbound: Some(client_tx),
            inbound: client_rx,
        },
        ChannelStream { rx: server_rx },
        ChannelSink { tx: server_tx },
    )
}
