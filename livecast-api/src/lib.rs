//! Livecast signaling API
//!
//! The per-connection signaling protocol handler and the axum router that
//! exposes it over WebSocket alongside a JSON health check.

pub mod error;
pub mod handler;
pub mod http;

pub use error::{HandlerError, HandlerResult};
pub use handler::SignalingHandler;
pub use http::{create_router, AppState, SIGNALING_PATH};
