//! Health check endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rooms: usize,
    pub peers: usize,
}

/// Health check router, served at both `/` and `/health`
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(HealthResponse {
        status: "ok",
        rooms: stats.active_rooms,
        peers: stats.total_peers,
    })
}
