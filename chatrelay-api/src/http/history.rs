//! Conversation history for clients catching up after being offline

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chatrelay_core::models::{ConversationId, OutboundMessage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::AuthPrincipal;
use super::{AppError, AppResult, AppState};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub conversation_id: ConversationId,
    /// Oldest first
    pub messages: Vec<OutboundMessage>,
}

/// `GET /api/conversations/{id}/messages?limit&offset`
pub async fn get_messages(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryResponse>> {
    let conversation_id = ConversationId::from_string(conversation_id);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);

    if !state.membership.is_member(&conversation_id, &principal).await? {
        return Err(AppError::forbidden(format!(
            "Not a member of conversation {conversation_id}"
        )));
    }

    let messages = state
        .store
        .history(&conversation_id, limit, offset)
        .await?;
    debug!(
        principal = %principal,
        conversation_id = %conversation_id,
        count = messages.len(),
        "History served"
    );

    Ok(Json(HistoryResponse {
        conversation_id,
        messages,
    }))
}
