//! Signaling messages
//!
//! One JSON object per WebSocket text frame, discriminated by `type`.
//! Field names are camelCase on the wire; unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use crate::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::{DtlsParameters, IceCandidate, IceParameters, TransportDirection};

/// Mute / speaking state of a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub audio_muted: bool,
    pub video_muted: bool,
    pub speaking: bool,
}

impl PeerStatus {
    pub fn set_muted(&mut self, kind: MediaKind, muted: bool) {
        match kind {
            MediaKind::Audio => self.audio_muted = muted,
            MediaKind::Video => self.video_muted = muted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub name: String,
    pub is_host: bool,
    #[serde(default)]
    pub status: PeerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// A chat line in a room's append-only log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: PeerId,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Commands sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        is_host: bool,
    },
    GetRouterCapabilities {
        room_id: RoomId,
        peer_id: PeerId,
    },
    CreateTransport {
        room_id: RoomId,
        peer_id: PeerId,
        direction: TransportDirection,
    },
    ConnectTransport {
        room_id: RoomId,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        room_id: RoomId,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        room_id: RoomId,
        peer_id: PeerId,
        /// Defaults to the peer's receive transport
        #[serde(default)]
        transport_id: Option<TransportId>,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        room_id: RoomId,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    },
    GetProducers {
        room_id: RoomId,
        peer_id: PeerId,
    },
    ChatMessage {
        room_id: RoomId,
        peer_id: PeerId,
        content: String,
    },
    GetMessages {
        room_id: RoomId,
        peer_id: PeerId,
    },
    MuteStatus {
        room_id: RoomId,
        peer_id: PeerId,
        kind: MediaKind,
        muted: bool,
    },
    Speaking {
        room_id: RoomId,
        peer_id: PeerId,
        speaking: bool,
    },
    LeaveRoom {
        room_id: RoomId,
        peer_id: PeerId,
    },
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "join-room",
    "get-router-capabilities",
    "create-transport",
    "connect-transport",
    "produce",
    "consume",
    "resume-consumer",
    "get-producers",
    "chat-message",
    "get-messages",
    "mute-status",
    "speaking",
    "leave-room",
];

impl ClientMessage {
    /// Decode and validate one inbound frame.
    ///
    /// An unrecognised `type` yields [`ProtocolError::UnknownType`], which
    /// callers drop after logging. Missing or ill-typed fields of a known type
    /// yield [`ProtocolError::InvalidPayload`].
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = value
            .as_object()
            .ok_or(ProtocolError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        let message: Self = serde_json::from_value(value).map_err(|e| {
            ProtocolError::InvalidPayload {
                kind,
                reason: e.to_string(),
            }
        })?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.room_id().as_str().is_empty() {
            return Err(ProtocolError::EmptyField("roomId"));
        }
        if self.peer_id().as_str().is_empty() {
            return Err(ProtocolError::EmptyField("peerId"));
        }
        Ok(())
    }

    /// Wire discriminator of this command
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::GetRouterCapabilities { .. } => "get-router-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resume-consumer",
            Self::GetProducers { .. } => "get-producers",
            Self::ChatMessage { .. } => "chat-message",
            Self::GetMessages { .. } => "get-messages",
            Self::MuteStatus { .. } => "mute-status",
            Self::Speaking { .. } => "speaking",
            Self::LeaveRoom { .. } => "leave-room",
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::GetRouterCapabilities { room_id, .. }
            | Self::CreateTransport { room_id, .. }
            | Self::ConnectTransport { room_id, .. }
            | Self::Produce { room_id, .. }
            | Self::Consume { room_id, .. }
            | Self::ResumeConsumer { room_id, .. }
            | Self::GetProducers { room_id, .. }
            | Self::ChatMessage { room_id, .. }
            | Self::GetMessages { room_id, .. }
            | Self::MuteStatus { room_id, .. }
            | Self::Speaking { room_id, .. }
            | Self::LeaveRoom { room_id, .. } => room_id,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        match self {
            Self::JoinRoom { peer_id, .. }
            | Self::GetRouterCapabilities { peer_id, .. }
            | Self::CreateTransport { peer_id, .. }
            | Self::ConnectTransport { peer_id, .. }
            | Self::Produce { peer_id, .. }
            | Self::Consume { peer_id, .. }
            | Self::ResumeConsumer { peer_id, .. }
            | Self::GetProducers { peer_id, .. }
            | Self::ChatMessage { peer_id, .. }
            | Self::GetMessages { peer_id, .. }
            | Self::MuteStatus { peer_id, .. }
            | Self::Speaking { peer_id, .. }
            | Self::LeaveRoom { peer_id, .. } => peer_id,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Responses and broadcasts sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    RoomInfo {
        room_id: RoomId,
        peers: Vec<PeerInfo>,
    },
    RouterCapabilities {
        rtp_capabilities: RtpCapabilities,
    },
    PeerJoined {
        peer_id: PeerId,
        name: String,
        is_host: bool,
    },
    TransportCreated {
        transport_id: TransportId,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    TransportConnected {
        transport_id: TransportId,
    },
    ProducerCreated {
        producer_id: ProducerId,
        kind: MediaKind,
    },
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    ConsumerCreated {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    ProducerList {
        producers: Vec<ProducerInfo>,
    },
    ChatMessage {
        message: ChatMessage,
    },
    MessageList {
        messages: Vec<ChatMessage>,
    },
    MuteStatus {
        peer_id: PeerId,
        kind: MediaKind,
        muted: bool,
    },
    Speaking {
        peer_id: PeerId,
        speaking: bool,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    Error {
        message: String,
        /// Type of the command that failed, absent for malformed frames
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            request: None,
        }
    }

    /// Error reply to a decoded command of type `request`
    pub fn command_error(request: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            request: Some(request.to_string()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomInfo { .. } => "room-info",
            Self::RouterCapabilities { .. } => "router-capabilities",
            Self::PeerJoined { .. } => "peer-joined",
            Self::TransportCreated { .. } => "transport-created",
            Self::TransportConnected { .. } => "transport-connected",
            Self::ProducerCreated { .. } => "producer-created",
            Self::NewProducer { .. } => "new-producer",
            Self::ConsumerCreated { .. } => "consumer-created",
            Self::ConsumerClosed { .. } => "consumer-closed",
            Self::ProducerList { .. } => "producer-list",
            Self::ChatMessage { .. } => "chat-message",
            Self::MessageList { .. } => "message-list",
            Self::MuteStatus { .. } => "mute-status",
            Self::Speaking { .. } => "speaking",
            Self::PeerLeft { .. } => "peer-left",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_room() {
        let msg = ClientMessage::parse(
            r#"{"type":"join-room","roomId":"r1","peerId":"a","name":"Alice","isHost":true,"extra":1}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: RoomId::from("r1"),
                peer_id: PeerId::from("a"),
                name: Some("Alice".to_string()),
                is_host: true,
            }
        );
        assert_eq!(msg.kind(), "join-room");
    }

    #[test]
    fn test_parse_unknown_type_is_ignorable() {
        let err = ClientMessage::parse(r#"{"type":"dance","roomId":"r1"}"#).unwrap_err();
        assert!(err.is_ignorable());
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "dance"));
    }

    #[test]
    fn test_parse_missing_field_names_it() {
        let err = ClientMessage::parse(r#"{"type":"chat-message","roomId":"r1","peerId":"a"}"#)
            .unwrap_err();
        assert!(!err.is_ignorable());
        assert!(err.to_string().contains("content"), "{err}");
    }

    #[test]
    fn test_parse_rejects_empty_room_id() {
        let err = ClientMessage::parse(r#"{"type":"leave-room","roomId":"","peerId":"a"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyField("roomId")));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(matches!(
            ClientMessage::parse("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"roomId":"r1"}"#).unwrap_err(),
            ProtocolError::MissingType
        ));
        assert!(matches!(
            ClientMessage::parse("{not json").unwrap_err(),
            ProtocolError::MalformedJson(_)
        ));
    }

    #[test]
    fn test_consume_transport_is_optional() {
        let msg = ClientMessage::parse(
            r#"{"type":"consume","roomId":"r1","peerId":"b","producerId":"p1","rtpCapabilities":{"codecs":[]}}"#,
        )
        .unwrap();

        match msg {
            ClientMessage::Consume { transport_id, .. } => assert!(transport_id.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_server_message_wire_shape() {
        let frame = ServerMessage::NewProducer {
            producer_id: ProducerId::from("p1"),
            peer_id: PeerId::from("a"),
            kind: MediaKind::Video,
        }
        .to_frame()
        .unwrap();

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "new-producer");
        assert_eq!(value["producerId"], "p1");
        assert_eq!(value["peerId"], "a");
        assert_eq!(value["kind"], "video");
        assert!(!frame.contains('\n'));
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = ServerMessage::error("Room not found: r9").to_frame().unwrap();
        assert_eq!(frame, r#"{"type":"error","message":"Room not found: r9"}"#);

        let frame = ServerMessage::command_error("speaking", "Not joined").to_frame().unwrap();
        assert_eq!(frame, r#"{"type":"error","message":"Not joined","request":"speaking"}"#);
        assert_eq!(
            serde_json::from_str::<ServerMessage>(r#"{"type":"error","message":"x"}"#).unwrap(),
            ServerMessage::error("x")
        );
    }
}
