//! Presence lookup against this process's registry
//!
//! Each process answers for the connections it holds. In a clustered
//! deployment a principal connected to another process is reported offline.

use axum::{
    extract::{Query, State},
    Json,
};
use chatrelay_core::models::Principal;
use serde::{Deserialize, Serialize};

use super::{auth::AuthPrincipal, AppError, AppResult, AppState};

/// Upper bound on principals per presence query
pub const MAX_PRESENCE_QUERY: usize = 500;

#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    /// Comma separated principal ids
    #[serde(default)]
    pub users: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceResponse {
    pub online: Vec<Principal>,
}

/// `GET /api/presence?users=a,b,c`
///
/// Requires a bearer token. Only connections held by this process are
/// reported.
pub async fn get_presence(
    State(state): State<AppState>,
    AuthPrincipal(_caller): AuthPrincipal,
    Query(query): Query<PresenceQuery>,
) -> AppResult<Json<PresenceResponse>> {
    let principals: Vec<Principal> = query
        .users
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(Principal::from)
        .collect();

    if principals.len() > MAX_PRESENCE_QUERY {
        return Err(AppError::bad_request(format!(
            "at most {MAX_PRESENCE_QUERY} users per query"
        )));
    }

    Ok(Json(PresenceResponse {
        online: state.bridge.registry().enumerate(&principals),
    }))
}
