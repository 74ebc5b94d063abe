//! User directory and conversation membership

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::{
    models::{ConversationId, Principal},
    Result,
};

#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn is_member(&self, conversation: &ConversationId, principal: &Principal)
        -> Result<bool>;

    /// All members of `conversation`, empty when it does not exist
    async fn members(&self, conversation: &ConversationId) -> Result<Vec<Principal>>;

    async fn user_exists(&self, principal: &Principal) -> Result<bool>;
}

/// In-process directory
///
/// In open mode every non-empty principal counts as an existing user, which
/// suits deployments where the credential issuer is the only user registry.
pub struct InMemoryMembership {
    open: bool,
    users: RwLock<HashSet<Principal>>,
    conversations: RwLock<HashMap<ConversationId, Vec<Principal>>>,
}

impl InMemoryMembership {
    /// Directory that only knows explicitly added users
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: false,
            users: RwLock::new(HashSet::new()),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Directory that accepts any principal as a user
    #[must_use]
    pub fn open() -> Self {
        Self {
            open: true,
            ..Self::new()
        }
    }

    pub fn add_user(&self, principal: impl Into<Principal>) {
        self.users.write().insert(principal.into());
    }

    /// Create or replace a conversation; its members become known users
    pub fn add_conversation<P>(&self, conversation: impl Into<ConversationId>, members: P)
    where
        P: IntoIterator,
        P::Item: Into<Principal>,
    {
        let members: Vec<Principal> = members.into_iter().map(Into::into).collect();
        {
            let mut users = self.users.write();
            users.extend(members.iter().cloned());
        }
        self.conversations.write().insert(conversation.into(), members);
    }

    #[must_use]
    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }

    /// Seeded members, or the two participants of a direct conversation
    fn members_of(&self, conversation: &ConversationId) -> Vec<Principal> {
        if let Some(members) = self.conversations.read().get(conversation) {
            return members.clone();
        }
        conversation
            .direct_participants()
            .map(|(a, b)| vec![a, b])
            .unwrap_or_default()
    }
}

impl Default for InMemoryMembership {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipService for InMemoryMembership {
    async fn is_member(
        &self,
        conversation: &ConversationId,
        principal: &Principal,
    ) -> Result<bool> {
        Ok(self.members_of(conversation).contains(principal))
    }

    async fn members(&self, conversation: &ConversationId) -> Result<Vec<Principal>> {
        Ok(self.members_of(conversation))
    }

    async fn user_exists(&self, principal: &Principal) -> Result<bool> {
        if principal.is_empty() {
            return Ok(false);
        }
        Ok(self.open || self.users.read().contains(principal))
    }
}
