use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for connection ids
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Authenticated user identity (the `sub` claim of a verified credential)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Principal {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Conversation ID (group or one-to-one)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable id for the one-to-one conversation between two principals,
    /// independent of argument order. The first principal is length-prefixed
    /// so principals containing `:` cannot collide.
    #[must_use]
    pub fn direct(a: &Principal, b: &Principal) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{DIRECT_PREFIX}{}:{first}:{second}",
            first.as_str().len()
        ))
    }

    /// The two participants of a [`ConversationId::direct`] id.
    /// Only the canonical encoding is accepted.
    #[must_use]
    pub fn direct_participants(&self) -> Option<(Principal, Principal)> {
        let (len, rest) = self.0.strip_prefix(DIRECT_PREFIX)?.split_once(':')?;
        let len: usize = len.parse().ok()?;
        let first = rest.get(..len)?;
        let second = rest.get(len..)?.strip_prefix(':')?;
        if first.is_empty() || second.is_empty() {
            return None;
        }

        let participants = (Principal::from(first), Principal::from(second));
        (Self::direct(&participants.0, &participants.1) == *self).then_some(participants)
    }
}

const DIRECT_PREFIX: &str = "dm:";

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_serializes_as_plain_string() {
        let principal = Principal::from("alice");
        assert_eq!(serde_json::to_string(&principal).unwrap(), "\"alice\"");

        let decoded: Principal = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(decoded.as_str(), "bob");
    }

    #[test]
    fn test_direct_conversation_is_order_independent() {
        let alice = Principal::from("alice");
        let bob = Principal::from("bob");

        assert_eq!(
            ConversationId::direct(&alice, &bob),
            ConversationId::direct(&bob, &alice)
        );
        assert_eq!(ConversationId::direct(&alice, &bob).as_str(), "dm:5:alice:bob");
    }

    #[test]
    fn test_direct_participants() {
        let id = ConversationId::direct(&Principal::from("bob"), &Principal::from("alice"));
        assert_eq!(
            id.direct_participants(),
            Some((Principal::from("alice"), Principal::from("bob")))
        );
        assert_eq!(ConversationId::from("general").direct_participants(), None);
        assert_eq!(ConversationId::from("dm:alice").direct_participants(), None);
        assert_eq!(ConversationId::from("dm:0::bob").direct_participants(), None);
        assert_eq!(ConversationId::from("dm:9:alice:bob").direct_participants(), None);
        // participants out of order or a padded length are not canonical
        assert_eq!(ConversationId::from("dm:3:bob:alice").direct_participants(), None);
        assert_eq!(ConversationId::from("dm:05:alice:bob").direct_participants(), None);
    }

    #[test]
    fn test_direct_ids_with_separator_do_not_collide() {
        let x = ConversationId::direct(&Principal::from("a:b"), &Principal::from("c"));
        let y = ConversationId::direct(&Principal::from("a"), &Principal::from("b:c"));

        assert_ne!(x, y);
        assert_eq!(
            x.direct_participants(),
            Some((Principal::from("a:b"), Principal::from("c")))
        );
        assert_eq!(
            y.direct_participants(),
            Some((Principal::from("a"), Principal::from("b:c")))
        );
    }

    #[test]
    fn test_generate_id_length() {
        assert_eq!(generate_id().len(), 12);
        assert_ne!(generate_id(), generate_id());
    }
}
