use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, TokenData,
    Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::AuthVerifier;
use crate::{models::Principal, Error, Result};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal::from_string(self.sub.clone())
    }
}

/// HS256 token verifier
///
/// Issuance lives outside this service; [`JwtVerifier::sign`] exists for
/// development setups and tests.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    leeway_seconds: u64,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("leeway_seconds", &self.leeway_seconds)
            .finish()
    }
}

impl JwtVerifier {
    pub fn new(secret: &[u8], leeway_seconds: u64) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidInput("JWT secret must not be empty".to_string()));
        }

        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            leeway_seconds,
        })
    }

    /// Sign a token for `principal` valid for `ttl`
    pub fn sign(&self, principal: &Principal, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: principal.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Verify a token and extract claims
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = self.leeway_seconds;

        let token_data: TokenData<Claims> = decode(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Authentication("Token expired".to_string()),
                ErrorKind::InvalidToken => Error::Authentication("Invalid token".to_string()),
                ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            })?;

        if token_data.claims.sub.is_empty() {
            return Err(Error::Authentication("Token has no subject".to_string()));
        }

        Ok(token_data.claims)
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Principal> {
        self.verify_token(credential).map(|claims| claims.principal())
    }
}
