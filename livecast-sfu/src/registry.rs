//! Room registry - process-wide map from room id to live room
//!
//! A room exists while it has at least one peer or is being created. Creation
//! goes through a per-id [`OnceCell`] slot, so concurrent joins for a new id
//! share a single router. Teardown marks the room closed under its own lock
//! before evicting the slot; a join that loses that race sees
//! [`SfuError::RoomClosed`] and retries against a fresh room.

use dashmap::DashMap;
use livecast_proto::{PeerId, RoomId, ServerMessage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastReport;
use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::peer::{ClosedResources, PeerSink};
use crate::room::Room;
use crate::store::MessageStore;
use crate::worker_pool::WorkerPool;

type RoomSlot = OnceCell<Arc<Room>>;

/// Aggregated registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub total_peers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
}

pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn MessageStore>,
    rooms: DashMap<RoomId, Arc<RoomSlot>>,
}

impl RoomRegistry {
    pub fn new(config: SfuConfig, pool: Arc<WorkerPool>, store: Arc<dyn MessageStore>) -> Arc<Self> {
        info!(
            workers = pool.len(),
            max_peers_per_room = config.max_peers_per_room,
            "Room registry initialized"
        );
        Arc::new(Self {
            config: Arc::new(config),
            pool,
            store,
            rooms: DashMap::new(),
        })
    }

    /// Return the live room for `room_id`, creating it (router plus stored
    /// chat history) if absent. Concurrent callers for the same id get the
    /// same room.
    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        let slot = Arc::clone(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );

        match slot.get_or_try_init(|| self.create_room(room_id)).await {
            Ok(room) => Ok(Arc::clone(room)),
            Err(e) => {
                self.rooms
                    .remove_if(room_id, |_, current| Arc::ptr_eq(current, &slot) && current.get().is_none());
                Err(e)
            }
        }
    }

    async fn create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        let router = self.pool.create_router().await?;
        let history = match self.store.load(room_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Failed to load chat history");
                Vec::new()
            }
        };

        info!(
            room_id = %room_id,
            router_id = %router.id(),
            history = history.len(),
            "Created new room"
        );
        Ok(Arc::new(Room::new(
            room_id.clone(),
            router,
            Arc::clone(&self.config),
            Arc::clone(&self.store),
            history,
        )))
    }

    /// Live room for `room_id`, if any
    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms
            .get(room_id)
            .and_then(|entry| entry.value().get().cloned())
    }

    pub fn room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        self.get(room_id)
            .ok_or_else(|| SfuError::RoomNotFound(room_id.clone()))
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.get(room_id).is_some()
    }

    /// Add a peer to a room, creating the room if needed
    pub async fn join(
        &self,
        room_id: &RoomId,
        peer_id: PeerId,
        name: String,
        is_host: bool,
        sink: Arc<dyn PeerSink>,
    ) -> Result<Arc<Room>> {
        loop {
            let room = self.get_or_create_room(room_id).await?;
            match room
                .join(peer_id.clone(), name.clone(), is_host, Arc::clone(&sink))
                .await
            {
                Ok(()) => return Ok(room),
                Err(SfuError::RoomClosed(_)) => {
                    debug!(room_id = %room_id, "Room closed during join, retrying");
                    self.evict(room_id, &room);
                }
                Err(e) => {
                    // A failed join into a room nobody else joined must not
                    // leave it behind
                    self.notify_empty(room_id).await;
                    return Err(e);
                }
            }
        }
    }

    /// Remove a peer from its room, destroying the room if it is now empty
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<ClosedResources> {
        let room = self.room(room_id)?;
        let removal = room.remove_peer(peer_id).await?;
        if removal.remaining == 0 {
            self.notify_empty(room_id).await;
        }
        Ok(removal.resources)
    }

    /// Destroy the room if it has no peers. Returns whether it was destroyed.
    pub async fn notify_empty(&self, room_id: &RoomId) -> bool {
        let Some(room) = self.get(room_id) else {
            return false;
        };
        if !room.close_if_empty().await {
            return false;
        }
        self.evict(room_id, &room);
        info!(
            room_id = %room_id,
            remaining_rooms = self.rooms.len(),
            "Room destroyed"
        );
        true
    }

    fn evict(&self, room_id: &RoomId, room: &Arc<Room>) {
        self.rooms.remove_if(room_id, |_, slot| {
            slot.get().is_some_and(|current| Arc::ptr_eq(current, room))
        });
    }

    /// Deliver a message to every peer of a room except `exclude`
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        message: &ServerMessage,
        exclude: Option<&PeerId>,
    ) -> Result<BroadcastReport> {
        Ok(self.room(room_id)?.broadcast(message, exclude).await)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.iter().filter(|entry| entry.value().get().is_some()).count()
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    fn live_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms = self.live_rooms();
        let mut stats = RegistryStats {
            active_rooms: rooms.len(),
            ..RegistryStats::default()
        };
        for room in rooms {
            let room_stats = room.stats().await;
            stats.total_peers += room_stats.peer_count;
            stats.total_transports += room_stats.transports;
            stats.total_producers += room_stats.producers;
            stats.total_consumers += room_stats.consumers;
        }
        stats
    }

    /// Periodically log aggregated statistics until cancelled
    pub fn spawn_stats_task(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            info!(interval_secs = period.as_secs(), "Starting statistics collection task");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = registry.stats().await;
                        debug!(
                            active_rooms = stats.active_rooms,
                            total_peers = stats.total_peers,
                            total_producers = stats.total_producers,
                            total_consumers = stats.total_consumers,
                            "Updated global statistics"
                        );
                    }
                }
            }
        })
    }

    /// Close every room, releasing all peers and routers
    pub async fn close_all(&self) {
        let rooms = self.live_rooms();
        let count = rooms.len();
        for room in rooms {
            room.close().await;
        }
        self.rooms.clear();
        info!(rooms = count, "All rooms closed");
    }
}
