//! Livecast signaling protocol definitions
//!
//! This crate contains the wire types shared by the signaling server and the
//! client driver: typed command/response unions, identifier newtypes and the
//! RTP / ICE / DTLS negotiation parameters they carry.

mod error;
mod ids;
mod message;
mod rtp;
mod transport;

pub use error::ProtocolError;
pub use ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
pub use message::{ChatMessage, ClientMessage, PeerInfo, PeerStatus, ProducerInfo, ServerMessage};
pub use rtp::{
    MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpParameters,
};
pub use transport::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, TransportDirection,
};
