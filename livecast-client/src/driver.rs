//! Client signaling driver
//!
//! A typed request/response state machine over a [`SignalingChannel`]:
//!
//! `Disconnected -> Connecting -> Connected -> Joined -> NegotiatingTransports
//! -> Ready -> Leaving -> Disconnected`
//!
//! Every request suspends until its matching response arrives. Unrelated
//! broadcasts received meanwhile (`peer-joined`, `new-producer`, chat, ...)
//! are applied to the local mirrors and forwarded as [`ClientEvent`]s in
//! arrival order. An `error` frame received while waiting fails the pending
//! request, unless the server tags it with a command that is never answered
//! on success (`resume-consumer`, `mute-status`, `speaking`); those errors
//! are delivered as [`ClientEvent::ServerError`] instead.

use indexmap::IndexMap;
use livecast_proto::{
    ChatMessage, ClientMessage, ConsumerId, MediaKind, PeerId, PeerInfo, PeerStatus, ProducerId,
    ProducerInfo, RoomId, RtpCapabilities, ServerMessage, TransportDirection, TransportId,
};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{SignalingChannel, WsChannel};
use crate::device::{LocalTrack, LocalTransport, MediaDevice, RemoteConsumer, TransportInfo};
use crate::error::{ClientError, Result};

/// Commands the server only answers when they fail
const UNACKNOWLEDGED_COMMANDS: [&str; 3] = ["resume-consumer", "mute-status", "speaking"];

fn fails_pending_request(request: Option<&str>) -> bool {
    !request.is_some_and(|kind| UNACKNOWLEDGED_COMMANDS.contains(&kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverState {
    Disconnected,
    Connecting,
    Connected,
    Joined,
    NegotiatingTransports,
    Ready,
    Leaving,
}

/// Local mirror of a remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub peer_id: PeerId,
    pub name: String,
    pub is_host: bool,
    pub status: PeerStatus,
}

impl From<PeerInfo> for RemotePeer {
    fn from(info: PeerInfo) -> Self {
        Self {
            peer_id: info.peer_id,
            name: info.name,
            is_host: info.is_host,
            status: info.status,
        }
    }
}

/// What the UI layer observes
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(DriverState),
    PeerJoined(RemotePeer),
    PeerLeft(PeerId),
    NewProducer(ProducerInfo),
    ConsumerReady(RemoteConsumer),
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    Chat(ChatMessage),
    MuteChanged {
        peer_id: PeerId,
        kind: MediaKind,
        muted: bool,
    },
    SpeakingChanged {
        peer_id: PeerId,
        speaking: bool,
    },
    /// An `error` frame not attributable to a pending request
    ServerError(String),
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Consume every remote producer once ready
    pub auto_consume: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self { auto_consume: true }
    }
}

pub struct SignalingDriver {
    device: Arc<dyn MediaDevice>,
    options: DriverOptions,
    channel: Option<Box<dyn SignalingChannel>>,
    state: DriverState,
    events: mpsc::UnboundedSender<ClientEvent>,

    peer_id: PeerId,
    room_id: Option<RoomId>,
    name: String,
    status: PeerStatus,

    send_transport: Option<Arc<dyn LocalTransport>>,
    recv_transport: Option<Arc<dyn LocalTransport>>,
    connected_transports: HashSet<TransportId>,

    peers: IndexMap<PeerId, RemotePeer>,
    remote_producers: IndexMap<ProducerId, ProducerInfo>,
    local_producers: IndexMap<ProducerId, LocalTrack>,
    consumers: IndexMap<ConsumerId, RemoteConsumer>,
    messages: Vec<ChatMessage>,
    pending_consume: VecDeque<ProducerId>,
}

impl SignalingDriver {
    pub fn new(device: Arc<dyn MediaDevice>) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        Self::with_options(device, DriverOptions::default())
    }

    pub fn with_options(
        device: Arc<dyn MediaDevice>,
        options: DriverOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let driver = Self {
            device,
            options,
            channel: None,
            state: DriverState::Disconnected,
            events,
            peer_id: PeerId::random(),
            room_id: None,
            name: String::new(),
            status: PeerStatus::default(),
            send_transport: None,
            recv_transport: None,
            connected_transports: HashSet::new(),
            peers: IndexMap::new(),
            remote_producers: IndexMap::new(),
            local_producers: IndexMap::new(),
            consumers: IndexMap::new(),
            messages: Vec::new(),
            pending_consume: VecDeque::new(),
        };
        (driver, rx)
    }

    #[must_use]
    pub const fn state(&self) -> DriverState {
        self.state
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    #[must_use]
    pub const fn status(&self) -> PeerStatus {
        self.status
    }

    /// Remote peers currently in the room, in join order
    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&RemotePeer> {
        self.peers.get(peer_id)
    }

    /// Remote producers known to this client
    pub fn remote_producers(&self) -> impl Iterator<Item = &ProducerInfo> {
        self.remote_producers.values()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &RemoteConsumer> {
        self.consumers.values()
    }

    pub fn local_producers(&self) -> impl Iterator<Item = (&ProducerId, &LocalTrack)> {
        self.local_producers.iter()
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn send_transport(&self) -> Option<Arc<dyn LocalTransport>> {
        self.send_transport.clone()
    }

    #[must_use]
    pub fn recv_transport(&self) -> Option<Arc<dyn LocalTransport>> {
        self.recv_transport.clone()
    }

    fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Driver state changed");
            self.state = state;
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The UI may have stopped listening
        let _ = self.events.send(event);
    }

    fn require(&self, expected: DriverState) -> Result<()> {
        if self.state != expected {
            return Err(ClientError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn joined_room(&self) -> Result<RoomId> {
        self.room_id.clone().ok_or(ClientError::InvalidState {
            expected: DriverState::Joined,
            actual: self.state,
        })
    }

    /// Open a WebSocket to the signaling server
    pub async fn connect(&mut self, url: &str) -> Result<()> {
        self.require(DriverState::Disconnected)?;
        self.set_state(DriverState::Connecting);
        match WsChannel::connect(url).await {
            Ok(channel) => {
                self.attach(Box::new(channel));
                Ok(())
            }
            Err(e) => {
                self.set_state(DriverState::Disconnected);
                Err(e)
            }
        }
    }

    /// Use an already open channel. Mints a fresh peer id for the connection.
    pub fn connect_with(&mut self, channel: Box<dyn SignalingChannel>) -> Result<()> {
        self.require(DriverState::Disconnected)?;
        self.set_state(DriverState::Connecting);
        self.attach(channel);
        Ok(())
    }

    fn attach(&mut self, channel: Box<dyn SignalingChannel>) {
        self.channel = Some(channel);
        self.peer_id = PeerId::random();
        info!(peer_id = %self.peer_id, "Signaling connected");
        self.set_state(DriverState::Connected);
    }

    async fn send(&mut self, message: ClientMessage) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(ClientError::Closed)?;
        debug!(kind = message.kind(), "Sending signaling message");
        channel.send(&message).await
    }

    async fn recv(&mut self) -> Result<ServerMessage> {
        let channel = self.channel.as_mut().ok_or(ClientError::Closed)?;
        match channel.recv().await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                self.handle_closed();
                Err(ClientError::Closed)
            }
            Err(e) => {
                self.handle_closed();
                Err(e)
            }
        }
    }

    /// Suspend until a frame selected by `select` arrives, applying every
    /// other frame as an event
    async fn wait_for<T>(&mut self, mut select: impl FnMut(&ServerMessage) -> Option<T>) -> Result<T> {
        loop {
            let message = self.recv().await?;
            if let Some(found) = select(&message) {
                self.apply(message);
                return Ok(found);
            }
            match message {
                ServerMessage::Error { message, request } if fails_pending_request(request.as_deref()) => {
                    return Err(ClientError::Server(message));
                }
                other => self.apply(other),
            }
        }
    }

    /// Join a room and negotiate both transports. Returns once `Ready`.
    pub async fn join(&mut self, room_id: RoomId, name: impl Into<String>, is_host: bool) -> Result<()> {
        self.require(DriverState::Connected)?;
        let name = name.into();

        self.send(ClientMessage::JoinRoom {
            room_id: room_id.clone(),
            peer_id: self.peer_id.clone(),
            name: Some(name.clone()),
            is_host,
        })
        .await?;
        self.wait_for(|m| matches!(m, ServerMessage::RoomInfo { .. }).then_some(()))
            .await?;
        let capabilities = self
            .wait_for(|m| match m {
                ServerMessage::RouterCapabilities { rtp_capabilities } => Some(rtp_capabilities.clone()),
                _ => None,
            })
            .await?;

        self.room_id = Some(room_id.clone());
        self.name = name;
        self.set_state(DriverState::Joined);
        info!(room_id = %room_id, peer_id = %self.peer_id, peers = self.peers.len(), "Joined room");

        self.device.load(&capabilities).await?;
        self.negotiate_transports().await?;

        if self.options.auto_consume {
            let producers = self.request_producers().await?;
            self.pending_consume
                .extend(producers.into_iter().map(|p| p.producer_id));
            self.drain_pending().await?;
        }
        Ok(())
    }

    async fn negotiate_transports(&mut self) -> Result<()> {
        self.set_state(DriverState::NegotiatingTransports);
        let send = self.create_transport(TransportDirection::Send).await?;
        self.send_transport = Some(send);
        let recv = self.create_transport(TransportDirection::Recv).await?;
        self.recv_transport = Some(recv);
        self.set_state(DriverState::Ready);
        Ok(())
    }

    async fn create_transport(&mut self, direction: TransportDirection) -> Result<Arc<dyn LocalTransport>> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::CreateTransport {
            room_id,
            peer_id: self.peer_id.clone(),
            direction,
        })
        .await?;
        let info = self
            .wait_for(|m| match m {
                ServerMessage::TransportCreated {
                    transport_id,
                    direction: created,
                    ice_parameters,
                    ice_candidates,
                    dtls_parameters,
                } if *created == direction => Some(TransportInfo {
                    id: transport_id.clone(),
                    direction,
                    ice_parameters: ice_parameters.clone(),
                    ice_candidates: ice_candidates.clone(),
                    dtls_parameters: dtls_parameters.clone(),
                }),
                _ => None,
            })
            .await?;
        debug!(transport_id = %info.id, %direction, "Transport created");
        self.device.create_transport(info).await
    }

    /// DTLS connect on first use of a transport
    async fn ensure_connected(&mut self, transport: &Arc<dyn LocalTransport>) -> Result<()> {
        if self.connected_transports.contains(transport.id()) {
            return Ok(());
        }
        let room_id = self.joined_room()?;
        let transport_id = transport.id().clone();
        self.send(ClientMessage::ConnectTransport {
            room_id,
            peer_id: self.peer_id.clone(),
            transport_id: transport_id.clone(),
            dtls_parameters: transport.local_dtls_parameters(),
        })
        .await?;
        self.wait_for(|m| match m {
            ServerMessage::TransportConnected { transport_id: id } if *id == transport_id => Some(()),
            _ => None,
        })
        .await?;
        self.connected_transports.insert(transport_id);
        Ok(())
    }

    /// Publish a local track
    pub async fn produce(&mut self, track: LocalTrack) -> Result<ProducerId> {
        self.require(DriverState::Ready)?;
        if !self.device.can_produce(track.kind) {
            return Err(ClientError::CannotProduce(track.kind));
        }
        let transport = self.send_transport.clone().ok_or(ClientError::InvalidState {
            expected: DriverState::Ready,
            actual: self.state,
        })?;

        let rtp_parameters = transport.send_track(&track).await?;
        self.ensure_connected(&transport).await?;

        let room_id = self.joined_room()?;
        self.send(ClientMessage::Produce {
            room_id,
            peer_id: self.peer_id.clone(),
            transport_id: transport.id().clone(),
            kind: track.kind,
            rtp_parameters,
        })
        .await?;
        let kind = track.kind;
        let producer_id = self
            .wait_for(|m| match m {
                ServerMessage::ProducerCreated { producer_id, kind: created } if *created == kind => {
                    Some(producer_id.clone())
                }
                _ => None,
            })
            .await?;

        transport.attach_producer(&producer_id, &track);
        info!(producer_id = %producer_id, kind = kind.as_str(), track_id = %track.id, "Producing track");
        self.local_producers.insert(producer_id.clone(), track);
        self.drain_pending().await?;
        Ok(producer_id)
    }

    /// Subscribe to a remote producer, set up the local track, then resume
    pub async fn consume(&mut self, producer_id: &ProducerId) -> Result<RemoteConsumer> {
        self.require(DriverState::Ready)?;
        let transport = self.recv_transport.clone().ok_or(ClientError::InvalidState {
            expected: DriverState::Ready,
            actual: self.state,
        })?;
        let room_id = self.joined_room()?;

        self.send(ClientMessage::Consume {
            room_id: room_id.clone(),
            peer_id: self.peer_id.clone(),
            transport_id: Some(transport.id().clone()),
            producer_id: producer_id.clone(),
            rtp_capabilities: self.device.rtp_capabilities(),
        })
        .await?;
        let consumer = self
            .wait_for(|m| match m {
                ServerMessage::ConsumerCreated {
                    consumer_id,
                    producer_id: created_for,
                    peer_id,
                    kind,
                    rtp_parameters,
                } if created_for == producer_id => Some(RemoteConsumer {
                    consumer_id: consumer_id.clone(),
                    producer_id: created_for.clone(),
                    peer_id: peer_id.clone(),
                    kind: *kind,
                    rtp_parameters: rtp_parameters.clone(),
                }),
                _ => None,
            })
            .await?;

        self.ensure_connected(&transport).await?;
        transport.receive(&consumer).await?;
        self.send(ClientMessage::ResumeConsumer {
            room_id,
            peer_id: self.peer_id.clone(),
            consumer_id: consumer.consumer_id.clone(),
        })
        .await?;

        debug!(consumer_id = %consumer.consumer_id, producer_id = %producer_id, "Consumer resumed");
        self.consumers
            .insert(consumer.consumer_id.clone(), consumer.clone());
        self.emit(ClientEvent::ConsumerReady(consumer.clone()));
        Ok(consumer)
    }

    /// Consume producers announced while busy
    async fn drain_pending(&mut self) -> Result<()> {
        while let Some(producer_id) = self.pending_consume.pop_front() {
            let already = self
                .consumers
                .values()
                .any(|c| c.producer_id == producer_id);
            if already || !self.remote_producers.contains_key(&producer_id) {
                continue;
            }
            if let Err(e) = self.consume(&producer_id).await {
                if matches!(e, ClientError::Closed) {
                    return Err(e);
                }
                warn!(producer_id = %producer_id, error = %e, "Auto-consume failed");
            }
        }
        Ok(())
    }

    pub async fn request_producers(&mut self) -> Result<Vec<ProducerInfo>> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::GetProducers {
            room_id,
            peer_id: self.peer_id.clone(),
        })
        .await?;
        self.wait_for(|m| match m {
            ServerMessage::ProducerList { producers } => Some(producers.clone()),
            _ => None,
        })
        .await
    }

    pub async fn request_messages(&mut self) -> Result<Vec<ChatMessage>> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::GetMessages {
            room_id,
            peer_id: self.peer_id.clone(),
        })
        .await?;
        self.wait_for(|m| match m {
            ServerMessage::MessageList { messages } => Some(messages.clone()),
            _ => None,
        })
        .await
    }

    pub async fn request_router_capabilities(&mut self) -> Result<RtpCapabilities> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::GetRouterCapabilities {
            room_id,
            peer_id: self.peer_id.clone(),
        })
        .await?;
        self.wait_for(|m| match m {
            ServerMessage::RouterCapabilities { rtp_capabilities } => Some(rtp_capabilities.clone()),
            _ => None,
        })
        .await
    }

    /// Send a chat line and wait for the server's echo
    pub async fn send_chat(&mut self, content: &str) -> Result<ChatMessage> {
        let room_id = self.joined_room()?;
        let expected = content.trim().to_string();
        self.send(ClientMessage::ChatMessage {
            room_id,
            peer_id: self.peer_id.clone(),
            content: content.to_string(),
        })
        .await?;
        let me = self.peer_id.clone();
        self.wait_for(|m| match m {
            ServerMessage::ChatMessage { message }
                if message.sender_id == me && message.content == expected =>
            {
                Some(message.clone())
            }
            _ => None,
        })
        .await
    }

    pub async fn set_muted(&mut self, kind: MediaKind, muted: bool) -> Result<()> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::MuteStatus {
            room_id,
            peer_id: self.peer_id.clone(),
            kind,
            muted,
        })
        .await?;
        self.status.set_muted(kind, muted);
        Ok(())
    }

    pub async fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        let room_id = self.joined_room()?;
        self.send(ClientMessage::Speaking {
            room_id,
            peer_id: self.peer_id.clone(),
            speaking,
        })
        .await?;
        self.status.speaking = speaking;
        Ok(())
    }

    /// Receive and apply one server frame. Returns `false` once the channel
    /// is closed.
    pub async fn process_next(&mut self) -> Result<bool> {
        if self.channel.is_none() {
            return Ok(false);
        }
        match self.recv().await {
            Ok(message) => {
                self.apply(message);
                self.drain_pending().await?;
                Ok(true)
            }
            Err(ClientError::Closed) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Leave the room and close the connection
    pub async fn leave(&mut self) -> Result<()> {
        let Some(room_id) = self.room_id.clone() else {
            return Err(ClientError::InvalidState {
                expected: DriverState::Ready,
                actual: self.state,
            });
        };
        self.set_state(DriverState::Leaving);
        let result = self
            .send(ClientMessage::LeaveRoom {
                room_id,
                peer_id: self.peer_id.clone(),
            })
            .await;
        self.disconnect().await;
        result
    }

    /// Close the connection without leaving explicitly; the server cleans
    /// up on socket close
    pub async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.reset().await;
        self.set_state(DriverState::Disconnected);
    }

    fn handle_closed(&mut self) {
        if self.channel.take().is_some() {
            warn!(peer_id = %self.peer_id, "Signaling channel closed by server");
        }
        self.set_state(DriverState::Disconnected);
    }

    async fn reset(&mut self) {
        for transport in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            transport.close().await;
        }
        self.room_id = None;
        self.status = PeerStatus::default();
        self.connected_transports.clear();
        self.peers.clear();
        self.remote_producers.clear();
        self.local_producers.clear();
        self.consumers.clear();
        self.messages.clear();
        self.pending_consume.clear();
    }

    /// Fold one server frame into the local mirrors
    fn apply(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::RoomInfo { peers, .. } => {
                self.peers = peers
                    .into_iter()
                    .map(|info| (info.peer_id.clone(), RemotePeer::from(info)))
                    .collect();
            }
            ServerMessage::PeerJoined {
                peer_id,
                name,
                is_host,
            } => {
                let peer = RemotePeer {
                    peer_id: peer_id.clone(),
                    name,
                    is_host,
                    status: PeerStatus::default(),
                };
                self.peers.insert(peer_id, peer.clone());
                self.emit(ClientEvent::PeerJoined(peer));
            }
            ServerMessage::PeerLeft { peer_id } => {
                self.peers.shift_remove(&peer_id);
                self.remote_producers.retain(|_, p| p.peer_id != peer_id);
                self.consumers.retain(|_, c| c.peer_id != peer_id);
                self.emit(ClientEvent::PeerLeft(peer_id));
            }
            ServerMessage::NewProducer {
                producer_id,
                peer_id,
                kind,
            } => {
                let info = ProducerInfo {
                    producer_id: producer_id.clone(),
                    peer_id,
                    kind,
                };
                self.remote_producers.insert(producer_id.clone(), info.clone());
                if self.options.auto_consume && self.state == DriverState::Ready {
                    self.pending_consume.push_back(producer_id);
                }
                self.emit(ClientEvent::NewProducer(info));
            }
            ServerMessage::ProducerList { producers } => {
                for info in producers {
                    self.remote_producers.insert(info.producer_id.clone(), info);
                }
            }
            ServerMessage::ConsumerClosed {
                consumer_id,
                producer_id,
            } => {
                self.consumers.shift_remove(&consumer_id);
                self.remote_producers.shift_remove(&producer_id);
                self.emit(ClientEvent::ConsumerClosed {
                    consumer_id,
                    producer_id,
                });
            }
            ServerMessage::ChatMessage { message } => {
                self.messages.push(message.clone());
                self.emit(ClientEvent::Chat(message));
            }
            ServerMessage::MessageList { messages } => {
                self.messages = messages;
            }
            ServerMessage::MuteStatus {
                peer_id,
                kind,
                muted,
            } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.status.set_muted(kind, muted);
                }
                self.emit(ClientEvent::MuteChanged {
                    peer_id,
                    kind,
                    muted,
                });
            }
            ServerMessage::Speaking { peer_id, speaking } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.status.speaking = speaking;
                }
                self.emit(ClientEvent::SpeakingChanged { peer_id, speaking });
            }
            ServerMessage::Error { message, request } => {
                warn!(error = %message, request = ?request, "Server reported an error");
                self.emit(ClientEvent::ServerError(message));
            }
            ServerMessage::RouterCapabilities { .. }
            | ServerMessage::TransportCreated { .. }
            | ServerMessage::TransportConnected { .. }
            | ServerMessage::ProducerCreated { .. }
            | ServerMessage::ConsumerCreated { .. } => {
                debug!("Response frame consumed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, MemoryChannelRemote};
    use crate::device::LoopbackDevice;
    use livecast_proto::{DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters};
    use serde_json::Value;

    fn push(remote: &MemoryChannelRemote, message: ServerMessage) {
        remote.tx.send(message.to_frame().unwrap()).unwrap();
    }

    async fn sent(remote: &mut MemoryChannelRemote) -> Value {
        let frame = remote.rx.recv().await.unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    fn transport_created(id: &str, direction: TransportDirection) -> ServerMessage {
        ServerMessage::TransportCreated {
            transport_id: TransportId::from(id),
            direction,
            ice_parameters: IceParameters {
                username_fragment: "u".to_string(),
                password: "p".to_string(),
                ice_lite: true,
            },
            ice_candidates: Vec::new(),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AA".to_string(),
                }],
            },
        }
    }

    fn other_peer(id: &str) -> PeerInfo {
        PeerInfo {
            peer_id: PeerId::from(id),
            name: id.to_uppercase(),
            is_host: false,
            status: PeerStatus::default(),
        }
    }

    /// Queue everything the server answers to a join, then join
    async fn joined_driver(
        auto_consume: bool,
    ) -> (SignalingDriver, MemoryChannelRemote, mpsc::UnboundedReceiver<ClientEvent>) {
        let device = Arc::new(LoopbackDevice::new());
        let (mut driver, events) = SignalingDriver::with_options(device, DriverOptions { auto_consume });
        let (channel, remote) = MemoryChannel::pair();
        driver.connect_with(Box::new(channel)).unwrap();

        push(
            &remote,
            ServerMessage::RoomInfo {
                room_id: RoomId::from("r1"),
                peers: vec![other_peer("b")],
            },
        );
        push(
            &remote,
            ServerMessage::RouterCapabilities {
                rtp_capabilities: livecast_sfu::default_capabilities(),
            },
        );
        push(&remote, ServerMessage::MessageList { messages: Vec::new() });
        push(&remote, transport_created("ts", TransportDirection::Send));
        push(&remote, transport_created("tr", TransportDirection::Recv));
        if auto_consume {
            push(&remote, ServerMessage::ProducerList { producers: Vec::new() });
        }

        driver.join(RoomId::from("r1"), "Alice", false).await.unwrap();
        (driver, remote, events)
    }

    #[tokio::test]
    async fn test_join_negotiates_both_transports() {
        let (driver, mut remote, mut events) = joined_driver(true).await;
        assert_eq!(driver.state(), DriverState::Ready);
        assert_eq!(driver.room_id(), Some(&RoomId::from("r1")));
        assert_eq!(driver.peers().count(), 1);
        assert_eq!(driver.send_transport().unwrap().id(), &TransportId::from("ts"));
        assert_eq!(driver.recv_transport().unwrap().id(), &TransportId::from("tr"));

        let join = sent(&mut remote).await;
        assert_eq!(join["type"], "join-room");
        assert_eq!(join["peerId"], driver.peer_id().as_str());
        assert_eq!(join["name"], "Alice");
        assert_eq!(sent(&mut remote).await["direction"], "send");
        assert_eq!(sent(&mut remote).await["direction"], "recv");
        assert_eq!(sent(&mut remote).await["type"], "get-producers");

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                DriverState::Connecting,
                DriverState::Connected,
                DriverState::Joined,
                DriverState::NegotiatingTransports,
                DriverState::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn test_operations_require_state() {
        let (mut driver, _events) = SignalingDriver::new(Arc::new(LoopbackDevice::new()));
        let err = driver
            .produce(LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidState {
                expected: DriverState::Ready,
                actual: DriverState::Disconnected
            }
        ));
        assert!(driver.join(RoomId::from("r1"), "a", false).await.is_err());
        assert!(driver.leave().await.is_err());
    }

    #[tokio::test]
    async fn test_error_frame_fails_pending_request() {
        let (mut driver, _events) = SignalingDriver::new(Arc::new(LoopbackDevice::new()));
        let (channel, remote) = MemoryChannel::pair();
        driver.connect_with(Box::new(channel)).unwrap();
        push(&remote, ServerMessage::error("Room is full"));

        let err = driver.join(RoomId::from("r1"), "a", false).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ref m) if m == "Room is full"));
        assert_eq!(driver.state(), DriverState::Connected);
    }

    #[tokio::test]
    async fn test_late_error_from_unanswered_command_becomes_event() {
        let (mut driver, mut remote, mut events) = joined_driver(false).await;
        for _ in 0..3 {
            sent(&mut remote).await;
        }
        while events.try_recv().is_ok() {}

        driver.set_speaking(true).await.unwrap();
        assert_eq!(sent(&mut remote).await["type"], "speaking");
        push(&remote, ServerMessage::command_error("speaking", "Peer not found: x"));
        push(
            &remote,
            ServerMessage::ChatMessage {
                message: ChatMessage {
                    id: "m1".to_string(),
                    room_id: RoomId::from("r1"),
                    sender_id: driver.peer_id().clone(),
                    sender_name: "Alice".to_string(),
                    content: "hi".to_string(),
                    timestamp: chrono::Utc::now(),
                },
            },
        );

        let echo = driver.send_chat("hi").await.unwrap();
        assert_eq!(echo.id, "m1");
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::ServerError("Peer not found: x".to_string())
        );

        push(&remote, ServerMessage::command_error("chat-message", "Message is empty"));
        let err = driver.send_chat("   ").await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ref m) if m == "Message is empty"));
        assert_eq!(driver.state(), DriverState::Ready);
    }

    #[tokio::test]
    async fn test_produce_connects_transport_once() {
        let (mut driver, mut remote, _events) = joined_driver(false).await;
        for _ in 0..3 {
            sent(&mut remote).await;
        }

        push(
            &remote,
            ServerMessage::TransportConnected {
                transport_id: TransportId::from("ts"),
            },
        );
        push(
            &remote,
            ServerMessage::ProducerCreated {
                producer_id: ProducerId::from("p1"),
                kind: MediaKind::Audio,
            },
        );
        let producer_id = driver
            .produce(LocalTrack::new("mic", MediaKind::Audio))
            .await
            .unwrap();
        assert_eq!(producer_id, ProducerId::from("p1"));
        assert_eq!(sent(&mut remote).await["type"], "connect-transport");
        let produce = sent(&mut remote).await;
        assert_eq!(produce["type"], "produce");
        assert_eq!(produce["transportId"], "ts");
        assert_eq!(produce["kind"], "audio");

        push(
            &remote,
            ServerMessage::ProducerCreated {
                producer_id: ProducerId::from("p2"),
                kind: MediaKind::Video,
            },
        );
        driver
            .produce(LocalTrack::new("cam", MediaKind::Video))
            .await
            .unwrap();
        assert_eq!(sent(&mut remote).await["type"], "produce");
        assert_eq!(driver.local_producers().count(), 2);
    }

    #[tokio::test]
    async fn test_broadcasts_update_mirrors_while_waiting() {
        let (mut driver, mut remote, mut events) = joined_driver(false).await;
        for _ in 0..3 {
            sent(&mut remote).await;
        }
        while events.try_recv().is_ok() {}

        push(
            &remote,
            ServerMessage::PeerJoined {
                peer_id: PeerId::from("c"),
                name: "C".to_string(),
                is_host: false,
            },
        );
        push(
            &remote,
            ServerMessage::MuteStatus {
                peer_id: PeerId::from("b"),
                kind: MediaKind::Audio,
                muted: true,
            },
        );
        push(
            &remote,
            ServerMessage::PeerLeft {
                peer_id: PeerId::from("c"),
            },
        );
        push(&remote, ServerMessage::MessageList { messages: Vec::new() });

        let messages = driver.request_messages().await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(sent(&mut remote).await["type"], "get-messages");

        assert!(driver.peer(&PeerId::from("c")).is_none());
        assert!(driver.peer(&PeerId::from("b")).unwrap().status.audio_muted);
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::PeerJoined(p) if p.peer_id == PeerId::from("c")));
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::MuteChanged { muted: true, .. }));
        assert!(matches!(events.try_recv().unwrap(), ClientEvent::PeerLeft(id) if id == PeerId::from("c")));
    }

    #[tokio::test]
    async fn test_auto_consume_on_new_producer() {
        let (mut driver, mut remote, _events) = joined_driver(true).await;
        for _ in 0..4 {
            sent(&mut remote).await;
        }

        push(
            &remote,
            ServerMessage::NewProducer {
                producer_id: ProducerId::from("p9"),
                peer_id: PeerId::from("b"),
                kind: MediaKind::Audio,
            },
        );
        push(
            &remote,
            ServerMessage::ConsumerCreated {
                consumer_id: ConsumerId::from("c1"),
                producer_id: ProducerId::from("p9"),
                peer_id: PeerId::from("b"),
                kind: MediaKind::Audio,
                rtp_parameters: livecast_proto::RtpParameters::default(),
            },
        );
        push(
            &remote,
            ServerMessage::TransportConnected {
                transport_id: TransportId::from("tr"),
            },
        );

        assert!(driver.process_next().await.unwrap());
        let consume = sent(&mut remote).await;
        assert_eq!(consume["type"], "consume");
        assert_eq!(consume["producerId"], "p9");
        assert_eq!(consume["transportId"], "tr");
        assert_eq!(sent(&mut remote).await["type"], "connect-transport");
        let resume = sent(&mut remote).await;
        assert_eq!(resume["type"], "resume-consumer");
        assert_eq!(resume["consumerId"], "c1");
        assert_eq!(driver.consumers().count(), 1);

        push(
            &remote,
            ServerMessage::ConsumerClosed {
                consumer_id: ConsumerId::from("c1"),
                producer_id: ProducerId::from("p9"),
            },
        );
        assert!(driver.process_next().await.unwrap());
        assert_eq!(driver.consumers().count(), 0);
    }

    #[tokio::test]
    async fn test_leave_resets_driver() {
        let (mut driver, mut remote, _events) = joined_driver(false).await;
        for _ in 0..3 {
            sent(&mut remote).await;
        }
        let transport = driver.send_transport().unwrap();

        driver.leave().await.unwrap();
        assert_eq!(sent(&mut remote).await["type"], "leave-room");
        assert_eq!(driver.state(), DriverState::Disconnected);
        assert!(driver.room_id().is_none());
        assert_eq!(driver.peers().count(), 0);
        assert!(transport.stats().await.is_err());
        assert!(!driver.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn test_server_close_disconnects() {
        let (mut driver, remote, _events) = joined_driver(false).await;
        drop(remote);
        assert!(!driver.process_next().await.unwrap());
        assert_eq!(driver.state(), DriverState::Disconnected);
    }
}
