//! Signaling protocol handler
//!
//! One [`SignalingHandler`] per WebSocket connection. It decodes each text
//! frame into a [`ClientMessage`], dispatches it to the room the connection
//! joined, and reports any failure as an `error` frame to this socket only.
//! The connection never closes because of a bad command.

use livecast_proto::{ClientMessage, PeerId, ProtocolError, RoomId, ServerMessage};
use livecast_sfu::{PeerSink, Room, RoomRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{HandlerError, HandlerResult};

struct Session {
    room_id: RoomId,
    peer_id: PeerId,
    room: Arc<Room>,
}

pub struct SignalingHandler {
    registry: Arc<RoomRegistry>,
    sink: Arc<dyn PeerSink>,
    connection_id: String,
    session: Option<Session>,
}

impl SignalingHandler {
    pub fn new(registry: Arc<RoomRegistry>, sink: Arc<dyn PeerSink>, connection_id: impl Into<String>) -> Self {
        Self {
            registry,
            sink,
            connection_id: connection_id.into(),
            session: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Room and peer this connection is joined as, if any
    #[must_use]
    pub fn session(&self) -> Option<(&RoomId, &PeerId)> {
        self.session
            .as_ref()
            .map(|session| (&session.room_id, &session.peer_id))
    }

    /// Handle one inbound text frame
    pub async fn handle_frame(&mut self, frame: &str) {
        let message = match ClientMessage::parse(frame) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                warn!(connection_id = %self.connection_id, kind = %kind, "Ignoring unknown message type");
                return;
            }
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Rejected malformed frame");
                self.reply_error(&HandlerError::Protocol(e));
                return;
            }
        };

        let kind = message.kind();
        if let Err(e) = self.handle(message).await {
            debug!(connection_id = %self.connection_id, kind, error = %e, "Command failed");
            self.reply(&ServerMessage::command_error(kind, e.to_string()));
        }
    }

    /// Dispatch one decoded command
    pub async fn handle(&mut self, message: ClientMessage) -> HandlerResult<()> {
        match message {
            ClientMessage::JoinRoom {
                room_id,
                peer_id,
                name,
                is_host,
            } => self.join(room_id, peer_id, name, is_host).await,

            ClientMessage::GetRouterCapabilities { room_id, .. } => {
                let room = self.registry.room(&room_id)?;
                self.reply(&ServerMessage::RouterCapabilities {
                    rtp_capabilities: room.rtp_capabilities(),
                });
                Ok(())
            }

            ClientMessage::CreateTransport {
                room_id,
                peer_id,
                direction,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session.room.create_transport(&peer_id, direction).await?;
                Ok(())
            }

            ClientMessage::ConnectTransport {
                room_id,
                peer_id,
                transport_id,
                dtls_parameters,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session
                    .room
                    .connect_transport(&peer_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(())
            }

            ClientMessage::Produce {
                room_id,
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session
                    .room
                    .produce(&peer_id, &transport_id, kind, rtp_parameters)
                    .await?;
                Ok(())
            }

            ClientMessage::Consume {
                room_id,
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session
                    .room
                    .consume(&peer_id, transport_id.as_ref(), &producer_id, &rtp_capabilities)
                    .await?;
                Ok(())
            }

            ClientMessage::ResumeConsumer {
                room_id,
                peer_id,
                consumer_id,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session.room.resume_consumer(&peer_id, &consumer_id).await?;
                Ok(())
            }

            ClientMessage::GetProducers { room_id, peer_id } => {
                let room = self.registry.room(&room_id)?;
                let producers = room.producers_for(&peer_id).await?;
                self.reply(&ServerMessage::ProducerList { producers });
                Ok(())
            }

            ClientMessage::ChatMessage {
                room_id,
                peer_id,
                content,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session.room.chat(&peer_id, &content).await?;
                Ok(())
            }

            ClientMessage::GetMessages { room_id, .. } => {
                let room = self.registry.room(&room_id)?;
                let messages = room.messages().await?;
                self.reply(&ServerMessage::MessageList { messages });
                Ok(())
            }

            ClientMessage::MuteStatus {
                room_id,
                peer_id,
                kind,
                muted,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session.room.set_muted(&peer_id, kind, muted).await?;
                Ok(())
            }

            ClientMessage::Speaking {
                room_id,
                peer_id,
                speaking,
            } => {
                let session = self.session_for(&room_id, &peer_id)?;
                session.room.set_speaking(&peer_id, speaking).await?;
                Ok(())
            }

            ClientMessage::LeaveRoom { room_id, peer_id } => {
                self.session_for(&room_id, &peer_id)?;
                self.leave().await?;
                Ok(())
            }
        }
    }

    async fn join(
        &mut self,
        room_id: RoomId,
        peer_id: PeerId,
        name: Option<String>,
        is_host: bool,
    ) -> HandlerResult<()> {
        if let Some(session) = &self.session {
            return Err(HandlerError::AlreadyJoined(session.room_id.clone()));
        }

        let name = name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| peer_id.to_string());
        let room = self
            .registry
            .join(&room_id, peer_id.clone(), name, is_host, Arc::clone(&self.sink))
            .await?;

        info!(
            connection_id = %self.connection_id,
            room_id = %room_id,
            peer_id = %peer_id,
            is_host,
            "Connection joined room"
        );
        self.session = Some(Session {
            room_id,
            peer_id,
            room,
        });
        Ok(())
    }

    /// Remove this connection's peer from its room
    async fn leave(&mut self) -> HandlerResult<()> {
        let Some(session) = self.session.take() else {
            return Err(HandlerError::NotJoined);
        };
        self.registry
            .leave(&session.room_id, &session.peer_id)
            .await?;
        info!(
            connection_id = %self.connection_id,
            room_id = %session.room_id,
            peer_id = %session.peer_id,
            "Connection left room"
        );
        Ok(())
    }

    /// Release everything this connection owns. Called once the socket is
    /// gone, whether or not the client sent `leave-room`.
    pub async fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        if let Err(e) = self.leave().await {
            warn!(connection_id = %self.connection_id, error = %e, "Cleanup after disconnect failed");
        }
    }

    fn session_for(&self, room_id: &RoomId, peer_id: &PeerId) -> HandlerResult<&Session> {
        let session = self.session.as_ref().ok_or(HandlerError::NotJoined)?;
        if &session.room_id != room_id {
            return Err(HandlerError::RoomMismatch(room_id.clone()));
        }
        if &session.peer_id != peer_id {
            return Err(HandlerError::PeerMismatch(peer_id.clone()));
        }
        Ok(session)
    }

    fn reply(&self, message: &ServerMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %self.connection_id, kind = message.kind(), error = %e, "Failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.sink.send(Arc::from(frame)) {
            warn!(connection_id = %self.connection_id, kind = message.kind(), error = %e, "Failed to deliver reply");
        }
    }

    fn reply_error(&self, error: &HandlerError) {
        self.reply(&ServerMessage::error(error.to_string()));
    }
}
