//! HTTP surface: health check and the signaling WebSocket upgrade

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use livecast_sfu::RoomRegistry;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Path of the signaling WebSocket
pub const SIGNALING_PATH: &str = "/ws";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    /// Outbound frames buffered per connection before sends start failing
    pub peer_queue_capacity: usize,
    /// Largest inbound WebSocket message accepted
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            peer_queue_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(SIGNALING_PATH, get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
