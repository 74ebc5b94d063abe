// Module: http
// WebSocket entry point plus the small REST surface around it

pub mod auth;
pub mod error;
pub mod health;
pub mod history;
pub mod presence;
pub mod websocket;

use axum::{routing::get, Router};
use chatrelay_cluster::RelayBus;
use chatrelay_core::service::{AuthVerifier, MembershipService, MessageStore};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bridge::ProtocolBridge;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<ProtocolBridge>,
    pub relay: Arc<RelayBus>,
    pub verifier: Arc<dyn AuthVerifier>,
    pub store: Arc<dyn MessageStore>,
    pub membership: Arc<dyn MembershipService>,
    /// Largest accepted WebSocket message
    pub max_message_bytes: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/presence", get(presence::get_presence))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(history::get_messages),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
