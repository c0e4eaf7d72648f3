//! Shared ambient stack for the livecast server: layered configuration and
//! structured logging.

pub mod bootstrap;
pub mod config;
pub mod logging;

pub use config::{Config, LoggingConfig, MediaConfig, ServerConfig, SignalingConfig};
