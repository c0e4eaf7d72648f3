//! Peer sessions
//!
//! A [`Peer`] is one connected participant. It exclusively owns its media
//! resources as a tree: transports, the producers published on its send
//! transport, and the consumers subscribed on its receive transport.
//! [`Peer::close`] walks that tree bottom-up (consumers, then producers, then
//! transports) so teardown never depends on the engine's own close
//! propagation.

use indexmap::IndexMap;
use livecast_proto::{
    ConsumerId, PeerId, PeerInfo, PeerStatus, ProducerId, ProducerInfo, ServerMessage,
    TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::engine::{MediaConsumer, MediaProducer, WebRtcTransport};
use crate::error::SendError;

/// Outbound half of a peer's connection
///
/// Implementations must not block: a slow or closed peer reports an error and
/// the caller moves on.
pub trait PeerSink: Send + Sync {
    fn send(&self, frame: Arc<str>) -> Result<(), SendError>;
}

/// [`PeerSink`] backed by a bounded channel drained by the socket writer task
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl PeerSink for ChannelSink {
    fn send(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

/// Serialize a message once for fan-out
pub(crate) fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match message.to_frame() {
        Ok(frame) => Some(Arc::from(frame)),
        Err(e) => {
            error!(kind = message.kind(), error = %e, "Failed to encode server message");
            None
        }
    }
}

pub(crate) struct TransportEntry {
    pub direction: TransportDirection,
    pub handle: Arc<dyn WebRtcTransport>,
}

pub(crate) struct ProducerEntry {
    pub transport_id: TransportId,
    pub handle: Arc<dyn MediaProducer>,
}

pub(crate) struct ConsumerEntry {
    pub transport_id: TransportId,
    pub source_peer_id: PeerId,
    pub handle: Arc<dyn MediaConsumer>,
}

/// Resources released by [`Peer::close`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClosedResources {
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

pub struct Peer {
    id: PeerId,
    name: String,
    is_host: bool,
    status: PeerStatus,
    sink: Arc<dyn PeerSink>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: IndexMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl Peer {
    pub fn new(id: PeerId, name: String, is_host: bool, sink: Arc<dyn PeerSink>) -> Self {
        Self {
            id,
            name,
            is_host,
            status: PeerStatus::default(),
            sink,
            transports: HashMap::new(),
            producers: IndexMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_host(&self) -> bool {
        self.is_host
    }

    #[must_use]
    pub const fn status(&self) -> PeerStatus {
        self.status
    }

    pub(crate) fn status_mut(&mut self) -> &mut PeerStatus {
        &mut self.status
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.id.clone(),
            name: self.name.clone(),
            is_host: self.is_host,
            status: self.status,
        }
    }

    /// Send a message to this peer only. Failures are logged, not returned.
    pub fn send(&self, message: &ServerMessage) -> bool {
        encode(message).is_some_and(|frame| self.send_frame(frame, message.kind()))
    }

    pub(crate) fn send_frame(&self, frame: Arc<str>, kind: &'static str) -> bool {
        match self.sink.send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer_id = %self.id, kind, error = %e, "Failed to deliver frame");
                false
            }
        }
    }

    pub(crate) fn transport(&self, id: &TransportId) -> Option<&TransportEntry> {
        self.transports.get(id)
    }

    pub(crate) fn transport_by_direction(
        &self,
        direction: TransportDirection,
    ) -> Option<(&TransportId, &TransportEntry)> {
        self.transports
            .iter()
            .find(|(_, entry)| entry.direction == direction)
    }

    pub(crate) fn insert_transport(&mut self, entry: TransportEntry) {
        self.transports.insert(entry.handle.id().clone(), entry);
    }

    pub(crate) fn insert_producer(&mut self, entry: ProducerEntry) {
        self.producers.insert(entry.handle.id().clone(), entry);
    }

    pub(crate) fn insert_consumer(&mut self, entry: ConsumerEntry) {
        self.consumers.insert(entry.handle.id().clone(), entry);
    }

    pub(crate) fn consumer(&self, id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(id)
    }

    #[must_use]
    pub fn owns_producer(&self, id: &ProducerId) -> bool {
        self.producers.contains_key(id)
    }

    /// Published producers, in publication order
    pub fn producers(&self) -> impl Iterator<Item = ProducerInfo> + '_ {
        self.producers.values().map(|entry| ProducerInfo {
            producer_id: entry.handle.id().clone(),
            peer_id: self.id.clone(),
            kind: entry.handle.kind(),
        })
    }

    /// Detach (without closing) every consumer fed by the given peer's
    /// producers
    pub(crate) fn take_consumers_from(&mut self, source: &PeerId) -> Vec<ConsumerEntry> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, entry)| &entry.source_peer_id == source)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Release every owned resource, children first. Idempotent.
    pub async fn close(&mut self) -> ClosedResources {
        let mut closed = ClosedResources::default();

        for (id, entry) in self.consumers.drain() {
            entry.handle.close().await;
            debug!(peer_id = %self.id, consumer_id = %id, transport_id = %entry.transport_id, "Consumer closed");
            closed.consumers.push(id);
        }

        for (id, entry) in self.producers.drain(..) {
            entry.handle.close().await;
            debug!(peer_id = %self.id, producer_id = %id, transport_id = %entry.transport_id, "Producer closed");
            closed.producers.push(id);
        }

        for (id, entry) in self.transports.drain() {
            entry.handle.close().await;
            debug!(peer_id = %self.id, transport_id = %id, direction = %entry.direction, "Transport closed");
            closed.transports.push(id);
        }

        closed
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        debug!(
            peer_id = %self.id,
            transports = self.transports.len(),
            producers = self.producers.len(),
            consumers = self.consumers.len(),
            "Peer dropped"
        );
    }
}
