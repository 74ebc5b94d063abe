//! Message persistence boundary

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::{
    models::{ConversationId, OutboundMessage, Principal},
    Error, Result,
};

/// Durable message storage
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a chat message, returning its sequence number within the
    /// conversation when the store assigns one
    async fn persist(&self, message: &OutboundMessage) -> Result<Option<i64>>;

    /// Record that `reader` has read `message_id`, which must belong to
    /// `conversation`
    async fn mark_read(
        &self,
        conversation: &ConversationId,
        message_id: &str,
        reader: &Principal,
    ) -> Result<()>;

    /// Page of a conversation's history, newest message last
    async fn history(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OutboundMessage>>;
}

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, Vec<OutboundMessage>>,
    /// message id -> conversation
    index: HashMap<String, ConversationId>,
    reads: HashMap<String, HashSet<Principal>>,
}

/// In-process reference store
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner.read().index.len()
    }

    #[must_use]
    pub fn readers(&self, message_id: &str) -> Vec<Principal> {
        let mut readers: Vec<_> = self
            .inner
            .read()
            .reads
            .get(message_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        readers.sort();
        readers
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(&self, message: &OutboundMessage) -> Result<Option<i64>> {
        let conversation = message.conversation().ok_or_else(|| {
            Error::InvalidInput(format!(
                "{} message {} has no conversation",
                message.payload.payload_type(),
                message.id
            ))
        })?;

        let mut inner = self.inner.write();
        if inner.index.contains_key(&message.id) {
            return Err(Error::Storage(format!(
                "message {} already persisted",
                message.id
            )));
        }

        let messages = inner.conversations.entry(conversation.clone()).or_default();
        let sequence = messages.last().and_then(|m| m.sequence).unwrap_or(0) + 1;
        let mut stored = message.clone();
        stored.sequence = Some(sequence);
        messages.push(stored);
        inner.index.insert(message.id.clone(), conversation);

        Ok(Some(sequence))
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        message_id: &str,
        reader: &Principal,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.index.get(message_id) {
            None => return Err(Error::NotFound(format!("message {message_id}"))),
            Some(owner) if owner != conversation => {
                return Err(Error::Authorization(format!(
                    "message {message_id} is not in conversation {conversation}"
                )));
            }
            Some(_) => {}
        }
        inner
            .reads
            .entry(message_id.to_string())
            .or_default()
            .insert(reader.clone());
        Ok(())
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<OutboundMessage>> {
        let inner = self.inner.read();
        let Some(messages) = inner.conversations.get(conversation) else {
            return Ok(Vec::new());
        };

        // offset counts back from the newest message
        let end = messages.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].to_vec())
    }
}
