//! SFU Configuration

use serde::{Deserialize, Serialize};

use crate::engine::TransportOptions;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Maximum chat message length in characters
    pub max_message_length: usize,
    /// IP the engine binds transports to
    pub listen_ip: String,
    /// Public IP advertised in ICE candidates
    pub announced_ip: Option<String>,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 0,
            max_message_length: 2000,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: self.announced_ip.clone(),
            ..TransportOptions::default()
        }
    }
}
