//! Health check endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub node_id: String,
    pub active_connections: usize,
    pub active_sessions: usize,
    pub total_registrations: u64,
    pub evictions: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub relay_published: u64,
    pub relay_received: u64,
    pub relay_duplicates: u64,
}

/// Counters of this process
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.bridge.registry().metrics();
    let relay = state.relay.metrics();
    Json(StatsResponse {
        node_id: state.relay.node_id().to_string(),
        active_connections: registry.active_connections,
        active_sessions: state.bridge.active_sessions(),
        total_registrations: registry.total_registrations,
        evictions: registry.evictions,
        delivered: registry.delivered,
        dropped: registry.dropped,
        relay_published: relay.published,
        relay_received: relay.received,
        relay_duplicates: relay.duplicates,
    })
}
