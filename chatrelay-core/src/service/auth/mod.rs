pub mod jwt;

use async_trait::async_trait;

use crate::{models::Principal, Error, Result};

pub use jwt::{Claims, JwtVerifier};

/// Turns a client credential into an authenticated principal
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    /// Verify `credential`, failing with [`Error::Authentication`]
    async fn verify(&self, credential: &str) -> Result<Principal>;
}

/// Extract bearer token from an Authorization header value
///
/// Accepts both "Bearer <token>" and "bearer <token>".
pub fn extract_bearer_token(auth_value: &str) -> Result<&str> {
    auth_value
        .strip_prefix("Bearer ")
        .or_else(|| auth_value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            Error::Authentication("Authorization header must be 'Bearer <token>'".to_string())
        })
}
