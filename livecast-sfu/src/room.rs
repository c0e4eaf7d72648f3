//! SFU Room - one media router and the peers attached to it
//!
//! All room state sits behind a single async mutex. Every mutating operation
//! sends its direct response and its broadcasts while still holding the lock,
//! so every peer observes room events in the same order they were applied.

use chrono::Utc;
use indexmap::IndexMap;
use livecast_proto::{
    ChatMessage, ConsumerId, DtlsParameters, MediaKind, PeerId, PeerStatus,
    ProducerId, ProducerInfo, RoomId, RtpCapabilities, RtpParameters, ServerMessage,
    TransportDirection, TransportId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::broadcast::{broadcast, BroadcastReport};
use crate::config::SfuConfig;
use crate::engine::MediaRouter;
use crate::error::{Result, SfuError};
use crate::peer::{ClosedResources, ConsumerEntry, Peer, PeerSink, ProducerEntry, TransportEntry};
use crate::store::MessageStore;

/// Room statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub messages: usize,
}

/// Result of removing a peer
#[derive(Debug)]
pub struct PeerRemoval {
    /// Peers still in the room
    pub remaining: usize,
    pub resources: ClosedResources,
}

#[derive(Default)]
struct RoomState {
    peers: IndexMap<PeerId, Peer>,
    messages: Vec<ChatMessage>,
    closed: bool,
}

impl RoomState {
    fn peer(&self, peer_id: &PeerId) -> Result<&Peer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    fn peer_mut(&mut self, peer_id: &PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    fn producer_owner(&self, producer_id: &ProducerId) -> Option<&PeerId> {
        self.peers
            .values()
            .find(|peer| peer.owns_producer(producer_id))
            .map(Peer::id)
    }

    fn broadcast(&self, message: &ServerMessage, exclude: Option<&PeerId>) -> BroadcastReport {
        broadcast(self.peers.values(), message, exclude)
    }
}

pub struct Room {
    id: RoomId,
    router: Arc<dyn MediaRouter>,
    config: Arc<SfuConfig>,
    store: Arc<dyn MessageStore>,
    state: Mutex<RoomState>,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        router: Arc<dyn MediaRouter>,
        config: Arc<SfuConfig>,
        store: Arc<dyn MessageStore>,
        history: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id,
            router,
            config,
            store,
            state: Mutex::new(RoomState {
                messages: history,
                ..RoomState::default()
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router_id(&self) -> &str {
        self.router.id()
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, RoomState>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(SfuError::RoomClosed(self.id.clone()));
        }
        Ok(state)
    }

    /// Admit a peer.
    ///
    /// The joiner receives `room-info` (the peers already present),
    /// `router-capabilities` and the chat history; everyone else receives
    /// `peer-joined`.
    pub async fn join(
        &self,
        peer_id: PeerId,
        name: String,
        is_host: bool,
        sink: Arc<dyn PeerSink>,
    ) -> Result<()> {
        let mut state = self.lock_open().await?;

        if state.peers.contains_key(&peer_id) {
            return Err(SfuError::PeerAlreadyJoined(peer_id));
        }
        let max = self.config.max_peers_per_room;
        if max > 0 && state.peers.len() >= max {
            warn!(room_id = %self.id, max_peers = max, "Peer limit reached for room");
            return Err(SfuError::RoomFull {
                room_id: self.id.clone(),
                max,
            });
        }

        let peer = Peer::new(peer_id.clone(), name.clone(), is_host, sink);
        peer.send(&ServerMessage::RoomInfo {
            room_id: self.id.clone(),
            peers: state.peers.values().map(Peer::info).collect(),
        });
        peer.send(&ServerMessage::RouterCapabilities {
            rtp_capabilities: self.router.rtp_capabilities(),
        });
        peer.send(&ServerMessage::MessageList {
            messages: state.messages.clone(),
        });

        state.broadcast(
            &ServerMessage::PeerJoined {
                peer_id: peer_id.clone(),
                name,
                is_host,
            },
            None,
        );
        state.peers.insert(peer_id.clone(), peer);

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            peer_count = state.peers.len(),
            "Peer joined room"
        );
        Ok(())
    }

    /// Create the peer's transport for one direction and reply with its
    /// ICE/DTLS parameters
    pub async fn create_transport(&self, peer_id: &PeerId, direction: TransportDirection) -> Result<()> {
        let mut state = self.lock_open().await?;
        if state.peer(peer_id)?.transport_by_direction(direction).is_some() {
            return Err(SfuError::TransportExists(direction));
        }

        let handle = self
            .router
            .create_webrtc_transport(&self.config.transport_options())
            .await?;
        let reply = ServerMessage::TransportCreated {
            transport_id: handle.id().clone(),
            direction,
            ice_parameters: handle.ice_parameters(),
            ice_candidates: handle.ice_candidates(),
            dtls_parameters: handle.dtls_parameters(),
        };

        debug!(room_id = %self.id, peer_id = %peer_id, transport_id = %handle.id(), %direction, "Transport created");
        let peer = state.peer_mut(peer_id)?;
        peer.insert_transport(TransportEntry { direction, handle });
        peer.send(&reply);
        Ok(())
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let state = self.lock_open().await?;
        let peer = state.peer(peer_id)?;
        let handle = peer
            .transport(transport_id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        handle.connect(dtls_parameters).await?;
        peer.send(&ServerMessage::TransportConnected {
            transport_id: transport_id.clone(),
        });
        debug!(room_id = %self.id, peer_id = %peer_id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Publish a track on the peer's send transport and announce it to the
    /// rest of the room
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let mut state = self.lock_open().await?;
        let handle = {
            let entry = state
                .peer(peer_id)?
                .transport(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
            if entry.direction != TransportDirection::Send {
                return Err(SfuError::WrongTransportDirection {
                    transport_id: transport_id.clone(),
                    expected: TransportDirection::Send,
                });
            }
            Arc::clone(&entry.handle)
        };

        let producer = handle.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().clone();

        let peer = state.peer_mut(peer_id)?;
        peer.insert_producer(ProducerEntry {
            transport_id: transport_id.clone(),
            handle: producer,
        });
        peer.send(&ServerMessage::ProducerCreated {
            producer_id: producer_id.clone(),
            kind,
        });

        state.broadcast(
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                peer_id: peer_id.clone(),
                kind,
            },
            Some(peer_id),
        );

        info!(room_id = %self.id, peer_id = %peer_id, producer_id = %producer_id, kind = kind.as_str(), "Producer created");
        Ok(producer_id)
    }

    /// Subscribe the peer to another peer's producer. The consumer starts
    /// paused; media flows after `resume_consumer`.
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: Option<&TransportId>,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerId> {
        let mut state = self.lock_open().await?;

        let (transport_id, handle) = {
            let peer = state.peer(peer_id)?;
            let (id, entry) = match transport_id {
                Some(id) => (
                    id,
                    peer.transport(id)
                        .ok_or_else(|| SfuError::TransportNotFound(id.clone()))?,
                ),
                None => peer
                    .transport_by_direction(TransportDirection::Recv)
                    .ok_or(SfuError::NoTransport(TransportDirection::Recv))?,
            };
            if entry.direction != TransportDirection::Recv {
                return Err(SfuError::WrongTransportDirection {
                    transport_id: id.clone(),
                    expected: TransportDirection::Recv,
                });
            }
            (id.clone(), Arc::clone(&entry.handle))
        };

        let source_peer_id = state
            .producer_owner(producer_id)
            .cloned()
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;

        if !self.router.can_consume(producer_id, rtp_capabilities) {
            return Err(SfuError::CannotConsume(producer_id.clone()));
        }

        let consumer = handle.consume(producer_id, rtp_capabilities, true).await?;
        let consumer_id = consumer.id().clone();
        let reply = ServerMessage::ConsumerCreated {
            consumer_id: consumer_id.clone(),
            producer_id: producer_id.clone(),
            peer_id: source_peer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };

        let peer = state.peer_mut(peer_id)?;
        peer.insert_consumer(ConsumerEntry {
            transport_id,
            source_peer_id,
            handle: consumer,
        });
        peer.send(&reply);

        debug!(room_id = %self.id, peer_id = %peer_id, consumer_id = %consumer_id, producer_id = %producer_id, "Consumer created");
        Ok(consumer_id)
    }

    pub async fn resume_consumer(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Result<()> {
        let state = self.lock_open().await?;
        let handle = state
            .peer(peer_id)?
            .consumer(consumer_id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        handle.resume().await?;
        debug!(room_id = %self.id, peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Every producer in the room except the requester's own
    pub async fn producers_for(&self, peer_id: &PeerId) -> Result<Vec<ProducerInfo>> {
        let state = self.lock_open().await?;
        Ok(state
            .peers
            .values()
            .filter(|peer| peer.id() != peer_id)
            .flat_map(Peer::producers)
            .collect())
    }

    pub async fn messages(&self) -> Result<Vec<ChatMessage>> {
        Ok(self.lock_open().await?.messages.clone())
    }

    /// Append a chat message and deliver it to every peer, sender included.
    ///
    /// Persistence is best effort: a store failure is logged and the message
    /// is still delivered.
    pub async fn chat(&self, peer_id: &PeerId, content: &str) -> Result<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SfuError::InvalidMessage("message is empty"));
        }
        if content.chars().count() > self.config.max_message_length {
            return Err(SfuError::InvalidMessage("message is too long"));
        }

        let mut state = self.lock_open().await?;
        let sender_name = state.peer(peer_id)?.name().to_string();
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: self.id.clone(),
            sender_id: peer_id.clone(),
            sender_name,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        state.messages.push(message.clone());

        if let Err(e) = self.store.append(&message).await {
            warn!(room_id = %self.id, message_id = %message.id, error = %e, "Failed to persist chat message");
        }

        state.broadcast(
            &ServerMessage::ChatMessage {
                message: message.clone(),
            },
            None,
        );
        Ok(message)
    }

    pub async fn set_muted(&self, peer_id: &PeerId, kind: MediaKind, muted: bool) -> Result<()> {
        let mut state = self.lock_open().await?;
        state.peer_mut(peer_id)?.status_mut().set_muted(kind, muted);
        state.broadcast(
            &ServerMessage::MuteStatus {
                peer_id: peer_id.clone(),
                kind,
                muted,
            },
            Some(peer_id),
        );
        Ok(())
    }

    pub async fn set_speaking(&self, peer_id: &PeerId, speaking: bool) -> Result<()> {
        let mut state = self.lock_open().await?;
        state.peer_mut(peer_id)?.status_mut().speaking = speaking;
        state.broadcast(
            &ServerMessage::Speaking {
                peer_id: peer_id.clone(),
                speaking,
            },
            Some(peer_id),
        );
        Ok(())
    }

    /// Remove a peer and release everything it owns.
    ///
    /// Consumers other peers hold on this peer's producers are closed first
    /// and their owners told via `consumer-closed`; the remaining peers then
    /// receive `peer-left`.
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Result<PeerRemoval> {
        let mut state = self.state.lock().await;
        let mut peer = state
            .peers
            .shift_remove(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))?;

        for other in state.peers.values_mut() {
            for entry in other.take_consumers_from(peer_id) {
                entry.handle.close().await;
                other.send(&ServerMessage::ConsumerClosed {
                    consumer_id: entry.handle.id().clone(),
                    producer_id: entry.handle.producer_id().clone(),
                });
            }
        }

        let resources = peer.close().await;
        state.broadcast(
            &ServerMessage::PeerLeft {
                peer_id: peer_id.clone(),
            },
            None,
        );

        info!(
            room_id = %self.id,
            peer_id = %peer_id,
            producers = resources.producers.len(),
            consumers = resources.consumers.len(),
            transports = resources.transports.len(),
            remaining_peers = state.peers.len(),
            "Peer left room"
        );

        Ok(PeerRemoval {
            remaining: state.peers.len(),
            resources,
        })
    }

    /// Deliver a message to every peer except `exclude`
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<&PeerId>) -> BroadcastReport {
        self.state.lock().await.broadcast(message, exclude)
    }

    /// Close the room if it has no peers. Once closed the room admits nobody;
    /// a later join for the same id builds a fresh room.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed || !state.peers.is_empty() {
            return false;
        }
        state.closed = true;
        self.router.close().await;
        debug!(room_id = %self.id, router_id = %self.router.id(), "Room router closed");
        true
    }

    /// Close every peer and the router regardless of occupancy
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, mut peer) in state.peers.drain(..) {
            peer.close().await;
        }
        self.router.close().await;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn peer_status(&self, peer_id: &PeerId) -> Option<PeerStatus> {
        self.state.lock().await.peers.get(peer_id).map(Peer::status)
    }

    /// Whether a consumer is paused, `None` if the peer or consumer is unknown
    pub async fn consumer_paused(&self, peer_id: &PeerId, consumer_id: &ConsumerId) -> Option<bool> {
        let state = self.state.lock().await;
        state
            .peers
            .get(peer_id)?
            .consumer(consumer_id)
            .map(|entry| entry.handle.is_paused())
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        state.peers.values().fold(
            RoomStats {
                messages: state.messages.len(),
                ..RoomStats::default()
            },
            |mut stats, peer| {
                stats.peer_count += 1;
                stats.transports += peer.transport_count();
                stats.producers += peer.producer_count();
                stats.consumers += peer.consumer_count();
                stats
            },
        )
    }
}
