//! Collaborator boundaries consumed by the connection hub

pub mod auth;
pub mod membership;
pub mod store;

pub use auth::{extract_bearer_token, AuthVerifier, Claims, JwtVerifier};
pub use membership::{InMemoryMembership, MembershipService};
pub use store::{InMemoryMessageStore, MessageStore};

#[cfg(any(test, feature = "mocks"))]
pub use auth::MockAuthVerifier;
#[cfg(any(test, feature = "mocks"))]
pub use membership::MockMembershipService;
#[cfg(any(test, feature = "mocks"))]
pub use store::MockMessageStore;
