// Bearer authentication for REST routes

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use chatrelay_core::models::Principal;
use chatrelay_core::service::extract_bearer_token;

use super::{AppError, AppState};

/// Principal authenticated from the `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct AuthPrincipal(pub Principal);

impl<S> FromRequestParts<S> for AuthPrincipal
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
            .to_str()
            .map_err(|e| AppError::unauthorized(format!("Invalid Authorization header: {e}")))?;

        let token = extract_bearer_token(auth_header)?;
        let principal = app_state
            .verifier
            .verify(token)
            .await
            .map_err(|e| AppError::unauthorized(e.to_string()))?;

        Ok(Self(principal))
    }
}
