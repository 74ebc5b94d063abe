pub mod id;
pub mod message;

pub use id::{generate_id, ConversationId, Principal};
pub use message::{now_millis, CallSignalKind, MessageKind, MessagePayload, OutboundMessage};
