use livecast_proto::{ConsumerId, PeerId, ProducerId, RoomId, TransportDirection, TransportId};
use thiserror::Error;

/// Failures reported by a media engine implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Worker {0} is closed")]
    WorkerClosed(String),

    #[error("Router {0} is closed")]
    RouterClosed(String),

    #[error("Transport {0} is closed")]
    TransportClosed(String),

    #[error("Transport {0} is already connected")]
    AlreadyConnected(String),

    #[error("Unknown producer {0}")]
    UnknownProducer(String),

    #[error("No codec in the RTP parameters is supported by the router")]
    UnsupportedCodec,

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(String),

    #[error("Invalid DTLS parameters: {0}")]
    InvalidDtls(String),

    #[error("Media engine failure: {0}")]
    Other(String),
}

/// Failures reported by a chat message store
#[derive(Error, Debug)]
#[error("Message store error: {0}")]
pub struct StoreError(pub String);

/// Failure to hand a frame to a peer's outbound queue
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Outbound queue full: peer too slow to consume messages")]
    Full,

    #[error("Outbound queue closed: peer disconnected")]
    Closed,
}

/// Orchestration errors. Their `Display` text is what clients see in
/// `error` frames, so variants never embed engine internals beyond ids.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Room {0} is closing")]
    RoomClosed(RoomId),

    #[error("Room {room_id} is full ({max} peers)")]
    RoomFull { room_id: RoomId, max: usize },

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer {0} already joined")]
    PeerAlreadyJoined(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Peer already has a {0} transport")]
    TransportExists(TransportDirection),

    #[error("No {0} transport for this peer")]
    NoTransport(TransportDirection),

    #[error("Transport {transport_id} is not a {expected} transport")]
    WrongTransportDirection {
        transport_id: TransportId,
        expected: TransportDirection,
    },

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("Invalid chat message: {0}")]
    InvalidMessage(&'static str),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SfuError>;
