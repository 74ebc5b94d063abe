//! Protocol bridge and WebSocket/HTTP front-end of the chatrelay hub

pub mod bridge;
pub mod codec;
pub mod error;
pub mod http;
pub mod session;
pub mod transport;

pub use bridge::{BridgeSettings, CloseReason, ProtocolBridge, SessionState};
pub use error::BridgeError;
pub use http::{create_router, AppState};
pub use transport::{channel_transport, ClientEnd, FrameStream, InboundError, SinkEvent};
