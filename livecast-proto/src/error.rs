use thiserror::Error;

/// Errors raised while decoding or validating a signaling frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Frame must be a JSON object")]
    NotAnObject,

    #[error("Frame is missing the \"type\" field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("Field \"{0}\" must not be empty")]
    EmptyField(&'static str),
}

impl ProtocolError {
    /// Unknown message types are logged and dropped rather than answered
    #[must_use]
    pub const fn is_ignorable(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}
