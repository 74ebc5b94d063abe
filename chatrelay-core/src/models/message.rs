use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{ConversationId, Principal};

/// Content kind of a chat message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
}

/// WebRTC call signaling step carried through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Relayed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        /// Client-side correlation id, echoed back untouched
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        text: String,
        #[serde(default)]
        kind: MessageKind,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        message_id: String,
    },
    CallSignal {
        call_id: String,
        signal: CallSignalKind,
        data: String,
    },
}

impl MessagePayload {
    #[must_use]
    pub const fn payload_type(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Typing { .. } => "typing",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::CallSignal { .. } => "call_signal",
        }
    }

    /// Only chat content is written to the message store
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Chat { .. })
    }
}

/// Message envelope routed through the registry and relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: String,
    pub sender: Principal,
    pub recipients: Vec<Principal>,
    pub payload: MessagePayload,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Store-assigned sequence number within the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

impl OutboundMessage {
    pub fn new(sender: Principal, recipients: Vec<Principal>, payload: MessagePayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender,
            recipients,
            payload,
            created_at: now_millis(),
            sequence: None,
        }
    }

    /// Conversation this message belongs to. Direct chat messages without an
    /// explicit conversation fall into the sender/recipient pair conversation.
    #[must_use]
    pub fn conversation(&self) -> Option<ConversationId> {
        match &self.payload {
            MessagePayload::Chat {
                conversation_id: Some(id),
                ..
            }
            | MessagePayload::Typing {
                conversation_id: id,
                ..
            }
            | MessagePayload::ReadReceipt {
                conversation_id: id,
                ..
            } => Some(id.clone()),
            MessagePayload::Chat {
                conversation_id: None,
                ..
            } => self
                .recipients
                .first()
                .map(|to| ConversationId::direct(&self.sender, to)),
            MessagePayload::CallSignal { .. } => None,
        }
    }

    #[must_use]
    pub fn is_addressed_to(&self, principal: &Principal) -> bool {
        self.recipients.iter().any(|r| r == principal)
    }
}

/// Current time truncated to millisecond precision, matching the wire format
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
