use livecast_proto::{PeerId, ProtocolError, RoomId};
use livecast_sfu::SfuError;
use thiserror::Error;

/// Failure handling one inbound command. The `Display` text becomes the
/// `message` of the `error` frame sent back to the originating socket.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sfu(#[from] SfuError),

    #[error("Connection already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("Connection has not joined a room")]
    NotJoined,

    #[error("Peer {0} does not belong to this connection")]
    PeerMismatch(PeerId),

    #[error("Connection is not joined to room {0}")]
    RoomMismatch(RoomId),
}

pub type HandlerResult<T> = Result<T, HandlerError>;
