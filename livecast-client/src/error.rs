use livecast_proto::{MediaKind, ProtocolError};
use thiserror::Error;

use crate::driver::DriverState;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid server frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Signaling channel closed")]
    Closed,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Operation requires state {expected:?}, driver is {actual:?}")]
    InvalidState {
        expected: DriverState,
        actual: DriverState,
    },

    #[error("Device cannot produce {0}")]
    CannotProduce(MediaKind),

    #[error("Device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
