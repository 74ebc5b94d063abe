//! WebSocket front-end
//!
//! Adapts an axum socket to the bridge's [`FrameStream`] / [`FrameSink`]
//! seams. Client frames are JSON text messages; binary messages are ignored
//! and a close message ends the session. Pongs surface as `ping` frames so
//! they count as activity against the bridge's idle timeout.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chatrelay_cluster::{Error as ClusterError, FrameSink, OutboundFrame};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tracing::{debug, info};

use crate::codec::{decode_client_frame, encode_server_frame, ClientFrame};
use crate::http::AppState;
use crate::transport::{FrameStream, InboundError};

pub struct WebSocketFrameStream {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for WebSocketFrameStream {
    async fn recv(&mut self) -> Option<Result<ClientFrame, InboundError>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(decode_client_frame(text.as_str()).map_err(InboundError::Decode));
                }
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => return Some(Ok(ClientFrame::Ping)),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(InboundError::Transport(e.to_string()))),
                Some(Ok(Message::Binary(_))) => {}
            }
        }
    }
}

pub struct WebSocketFrameSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketFrameSink {
    async fn send(&mut self, frame: &OutboundFrame) -> chatrelay_cluster::Result<()> {
        let text =
            encode_server_frame(frame).map_err(|e| ClusterError::Serialization(e.to_string()))?;
        self.sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn keepalive(&mut self) -> chatrelay_cluster::Result<()> {
        self.sender
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sender.send(Message::Close(None)).await;
        let _ = self.sender.close().await;
    }
}

/// `GET /ws`
///
/// The first client frame must be `{"type":"auth","token":"..."}`.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let bridge = state.bridge.clone();
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| async move {
            debug!("WebSocket upgraded");
            let (sender, receiver) = socket.split();
            let reason = bridge
                .run(
                    WebSocketFrameStream { receiver },
                    WebSocketFrameSink { sender },
                )
                .await;
            info!(reason = reason.as_str(), "WebSocket connection finished");
        })
}
