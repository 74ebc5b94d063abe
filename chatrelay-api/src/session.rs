//! Domain operations of an authenticated session

use chatrelay_cluster::{ConnectionHandle, Error as ClusterError, OutboundFrame, RelayBus};
use chatrelay_core::models::{
    CallSignalKind, ConversationId, MessageKind, MessagePayload, OutboundMessage, Principal,
};
use chatrelay_core::service::{MembershipService, MessageStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::ClientFrame;
use crate::error::BridgeError;

type SessionResult<T> = Result<T, BridgeError>;

/// Collaborators shared by every session of a process
#[derive(Clone)]
pub struct SessionServices {
    pub store: Arc<dyn MessageStore>,
    pub membership: Arc<dyn MembershipService>,
    pub relay: Arc<RelayBus>,
}

/// Turns inbound frames of one principal into persisted, relayed messages
pub struct SessionHandler {
    principal: Principal,
    handle: ConnectionHandle,
    services: SessionServices,
    max_text_length: usize,
}

impl SessionHandler {
    #[must_use]
    pub const fn new(
        principal: Principal,
        handle: ConnectionHandle,
        services: SessionServices,
        max_text_length: usize,
    ) -> Self {
        Self {
            principal,
            handle,
            services,
            max_text_length,
        }
    }

    /// Process one frame; failures go back to this session as `error` frames
    pub async fn handle(&self, frame: ClientFrame) {
        let kind = frame.kind();
        if let Err(err) = self.dispatch(frame).await {
            debug!(
                principal = %self.principal,
                frame = kind,
                code = err.code(),
                error = %err,
                "Client frame rejected"
            );
            self.reject(&err);
        }
    }

    /// Report `err` to this session only
    pub fn reject(&self, err: &BridgeError) {
        if let BridgeError::Persistence(_) | BridgeError::Internal(_) = err {
            warn!(principal = %self.principal, error = %err, "Session operation failed");
        }
        self.enqueue_own(OutboundFrame::error(err.code(), err.client_message()));
    }

    async fn dispatch(&self, frame: ClientFrame) -> SessionResult<()> {
        match frame {
            ClientFrame::Auth { .. } => Err(BridgeError::InvalidInput(
                "session is already authenticated".to_string(),
            )),
            ClientFrame::Ping => Ok(()),
            ClientFrame::Send {
                to,
                conversation_id,
                text,
                message_type,
                client_id,
            } => {
                self.send_chat(to, conversation_id, text, message_type, client_id)
                    .await
            }
            ClientFrame::Typing {
                conversation_id,
                is_typing,
            } => self.send_typing(conversation_id, is_typing).await,
            ClientFrame::ReadReceipt {
                conversation_id,
                message_id,
            } => self.send_read_receipt(conversation_id, message_id).await,
            ClientFrame::CallSignal {
                to,
                call_id,
                signal,
                data,
            } => self.send_call_signal(to, call_id, signal, data).await,
        }
    }

    async fn send_chat(
        &self,
        to: Option<Principal>,
        conversation_id: Option<ConversationId>,
        text: String,
        kind: MessageKind,
        client_id: Option<String>,
    ) -> SessionResult<()> {
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidInput("text must not be empty".to_string()));
        }
        if text.chars().count() > self.max_text_length {
            return Err(BridgeError::InvalidInput(format!(
                "text exceeds {} characters",
                self.max_text_length
            )));
        }

        let recipients = match (to, &conversation_id) {
            (None, None) => {
                return Err(BridgeError::InvalidInput(
                    "message needs a recipient or a conversation".to_string(),
                ));
            }
            (Some(to), conversation) => {
                self.require_known_peer(&to).await?;
                if let Some(conversation) = conversation {
                    self.require_member(conversation, &self.principal).await?;
                    self.require_member(conversation, &to).await?;
                }
                vec![to]
            }
            (None, Some(conversation)) => self.other_members(conversation).await?,
        };

        let mut message = OutboundMessage::new(
            self.principal.clone(),
            recipients,
            MessagePayload::Chat {
                conversation_id,
                client_id,
                text,
                kind,
            },
        );

        message.sequence = self
            .services
            .store
            .persist(&message)
            .await
            .map_err(|e| BridgeError::Persistence(e.to_string()))?;

        info!(
            principal = %self.principal,
            message_id = %message.id,
            recipients = message.recipients.len(),
            sequence = ?message.sequence,
            "Chat message accepted"
        );

        self.publish(message.clone());
        // Local echo; the relay never addresses the sender
        self.enqueue_own(OutboundFrame::message(message));
        Ok(())
    }

    async fn send_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> SessionResult<()> {
        self.require_member(&conversation_id, &self.principal).await?;
        let recipients = self.other_members(&conversation_id).await?;

        self.publish(OutboundMessage::new(
            self.principal.clone(),
            recipients,
            MessagePayload::Typing {
                conversation_id,
                is_typing,
            },
        ));
        Ok(())
    }

    async fn send_read_receipt(
        &self,
        conversation_id: ConversationId,
        message_id: String,
    ) -> SessionResult<()> {
        if message_id.is_empty() {
            return Err(BridgeError::InvalidInput("message_id must not be empty".to_string()));
        }
        self.require_member(&conversation_id, &self.principal).await?;

        self.services
            .store
            .mark_read(&conversation_id, &message_id, &self.principal)
            .await
            .map_err(|e| match e {
                chatrelay_core::Error::NotFound(_) => {
                    BridgeError::InvalidInput(format!("unknown message {message_id}"))
                }
                chatrelay_core::Error::Authorization(_) => BridgeError::PermissionDenied(format!(
                    "message {message_id} is not in conversation {conversation_id}"
                )),
                other => BridgeError::Persistence(other.to_string()),
            })?;

        let recipients = self.other_members(&conversation_id).await?;
        self.publish(OutboundMessage::new(
            self.principal.clone(),
            recipients,
            MessagePayload::ReadReceipt {
                conversation_id,
                message_id,
            },
        ));
        Ok(())
    }

    async fn send_call_signal(
        &self,
        to: Principal,
        call_id: String,
        signal: CallSignalKind,
        data: String,
    ) -> SessionResult<()> {
        if call_id.is_empty() {
            return Err(BridgeError::InvalidInput("call_id must not be empty".to_string()));
        }
        if data.is_empty() {
            return Err(BridgeError::InvalidInput("signal data must not be empty".to_string()));
        }
        self.require_known_peer(&to).await?;

        self.publish(OutboundMessage::new(
            self.principal.clone(),
            vec![to],
            MessagePayload::CallSignal {
                call_id,
                signal,
                data,
            },
        ));
        Ok(())
    }

    async fn require_known_peer(&self, to: &Principal) -> SessionResult<()> {
        if *to == self.principal {
            return Err(BridgeError::InvalidInput(
                "cannot address your own session".to_string(),
            ));
        }
        let exists = self
            .services
            .membership
            .user_exists(to)
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        if exists {
            Ok(())
        } else {
            Err(BridgeError::UnknownRecipient(format!("unknown user {to}")))
        }
    }

    async fn require_member(
        &self,
        conversation: &ConversationId,
        principal: &Principal,
    ) -> SessionResult<()> {
        let member = self
            .services
            .membership
            .is_member(conversation, principal)
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        if member {
            Ok(())
        } else {
            Err(BridgeError::PermissionDenied(format!(
                "{principal} is not a member of {conversation}"
            )))
        }
    }

    /// Members of `conversation` except this session's principal; the
    /// principal itself must be a member
    async fn other_members(&self, conversation: &ConversationId) -> SessionResult<Vec<Principal>> {
        let members = self
            .services
            .membership
            .members(conversation)
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()))?;

        if !members.contains(&self.principal) {
            return Err(BridgeError::PermissionDenied(format!(
                "{} is not a member of {conversation}",
                self.principal
            )));
        }
        Ok(members
            .into_iter()
            .filter(|member| *member != self.principal)
            .collect())
    }

    fn publish(&self, message: OutboundMessage) {
        if message.recipients.is_empty() {
            debug!(message_id = %message.id, "No recipients, nothing to relay");
            return;
        }
        // Broker trouble never fails the client operation
        if let Err(e) = self.services.relay.publish(message) {
            warn!(principal = %self.principal, error = %e, "Relay publish dropped");
        }
    }

    fn enqueue_own(&self, frame: OutboundFrame) {
        match self.handle.enqueue(frame) {
            Ok(()) => {}
            Err(ClusterError::QueueFull { capacity }) => {
                warn!(
                    principal = %self.principal,
                    connection_id = %self.handle.connection_id(),
                    capacity,
                    "Own outbound queue full, frame dropped"
                );
            }
            Err(e) => {
                debug!(principal = %self.principal, error = %e, "Session closing, frame dropped");
            }
        }
    }
}
