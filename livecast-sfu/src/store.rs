//! Chat persistence
//!
//! A room keeps its chat log in memory and writes every message through to a
//! [`MessageStore`]. When a room with the same id is created again later, the
//! stored history is loaded back so newly joined peers still get the full log.

use async_trait::async_trait;
use dashmap::DashMap;
use livecast_proto::{ChatMessage, RoomId};

use crate::error::StoreError;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Messages of a room in submission order
    async fn load(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Process-local store, the default when no external backing store is wired
#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<RoomId, Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.rooms
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn load(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}
