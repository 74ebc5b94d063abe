//! JSON wire format of the WebSocket front-end
//!
//! Every frame is a JSON object tagged by `type`.

use chatrelay_cluster::OutboundFrame;
use chatrelay_core::models::{
    CallSignalKind, ConversationId, MessageKind, OutboundMessage, Principal,
};
use serde::{Deserialize, Serialize};

/// Client to server frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Send {
        to: Option<Principal>,
        conversation_id: Option<ConversationId>,
        text: String,
        #[serde(default)]
        message_type: MessageKind,
        client_id: Option<String>,
    },
    Typing {
        conversation_id: ConversationId,
        #[serde(default = "default_true")]
        is_typing: bool,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        message_id: String,
    },
    CallSignal {
        to: Principal,
        call_id: String,
        signal: CallSignalKind,
        data: String,
    },
    Ping,
}

const fn default_true() -> bool {
    true
}

impl ClientFrame {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Send { .. } => "send",
            Self::Typing { .. } => "typing",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::CallSignal { .. } => "call_signal",
            Self::Ping => "ping",
        }
    }

    /// Direct text message, the common case
    #[must_use]
    pub fn text_to(to: impl Into<Principal>, text: impl Into<String>) -> Self {
        Self::Send {
            to: Some(to.into()),
            conversation_id: None,
            text: text.into(),
            message_type: MessageKind::Text,
            client_id: None,
        }
    }
}

/// Server to client frames, borrowed from the queued [`OutboundFrame`]
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Ready {
        principal: &'a Principal,
        connection_id: &'a str,
    },
    Message {
        #[serde(flatten)]
        message: &'a OutboundMessage,
    },
    Error {
        code: &'a str,
        message: &'a str,
    },
}

impl<'a> From<&'a OutboundFrame> for ServerFrame<'a> {
    fn from(frame: &'a OutboundFrame) -> Self {
        match frame {
            OutboundFrame::Ready {
                principal,
                connection_id,
            } => Self::Ready {
                principal,
                connection_id: connection_id.as_str(),
            },
            OutboundFrame::Message(message) => Self::Message {
                message: message.as_ref(),
            },
            OutboundFrame::Error { code, message } => Self::Error {
                code: *code,
                message: message.as_str(),
            },
        }
    }
}

pub fn decode_client_frame(text: &str) -> Result<ClientFrame, String> {
    serde_json::from_str(text).map_err(|e| format!("malformed frame: {e}"))
}

pub fn encode_server_frame(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&ServerFrame::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::models::MessagePayload;
    use serde_json::Value;

    #[test]
    fn test_decode_direct_send() {
        let frame = decode_client_frame(r#"{"type":"send","to":"bob","text":"hi"}"#).unwrap();
        assert_eq!(frame, ClientFrame::text_to("bob", "hi"));
        assert_eq!(frame.kind(), "send");
    }

    #[test]
    fn test_decode_group_send_with_kind() {
        let frame = decode_client_frame(
            r#"{"type":"send","conversation_id":"general","text":"pic","message_type":"image","client_id":"c-9"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Send {
                to: None,
                conversation_id: Some("general".into()),
                text: "pic".to_string(),
                message_type: MessageKind::Image,
                client_id: Some("c-9".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_typing_defaults_to_started() {
        let frame = decode_client_frame(r#"{"type":"typing","conversation_id":"c"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Typing {
                conversation_id: "c".into(),
                is_typing: true
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(decode_client_frame(r#"{"type":"teleport"}"#).is_err());
        assert!(decode_client_frame(r#"{"type":"send"}"#).is_err());
        assert!(decode_client_frame("hello").is_err());
        assert_eq!(decode_client_frame(r#"{"type":"ping"}"#).unwrap(), ClientFrame::Ping);
    }

    #[test]
    fn test_encode_message_frame() {
        let message = OutboundMessage::new(
            "alice".into(),
            vec!["bob".into()],
            MessagePayload::Chat {
                conversation_id: None,
                client_id: None,
                text: "hi".to_string(),
                kind: MessageKind::Text,
            },
        );
        let json: Value =
            serde_json::from_str(&encode_server_frame(&OutboundFrame::message(message.clone())).unwrap())
                .unwrap();

        assert_eq!(json["type"], "message");
        assert_eq!(json["id"], message.id.as_str());
        assert_eq!(json["sender"], "alice");
        assert_eq!(json["payload"]["type"], "chat");
        assert_eq!(json["payload"]["text"], "hi");
        assert_eq!(json["created_at"], message.created_at.timestamp_millis());
    }

    #[test]
    fn test_encode_ready_and_error() {
        let ready = OutboundFrame::Ready {
            principal: "alice".into(),
            connection_id: "abc".to_string(),
        };
        let json: Value = serde_json::from_str(&encode_server_frame(&ready).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type":"ready","principal":"alice","connection_id":"abc"}));

        let error = OutboundFrame::error("INVALID_INPUT", "text must not be empty");
        let json: Value = serde_json::from_str(&encode_server_frame(&error).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type":"error","code":"INVALID_INPUT","message":"text must not be empty"})
        );
    }
}
