//! Livecast SFU (Selective Forwarding Unit) orchestration
//!
//! Room and peer lifecycle on top of an external media engine. Each room owns
//! one media router; every participant publishes tracks on a send transport
//! and subscribes to the others' tracks on a receive transport.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed set of media workers, random router placement
//! - **`RoomRegistry`**: room id to live room, race-free create and teardown
//! - **`Room`**: one router plus its peers and chat log
//! - **`Peer`**: one participant and the transports, producers and consumers it owns
//! - **`MediaEngine`** and friends: the capability the forwarding engine provides
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_sfu::{LoopbackEngine, MemoryMessageStore, RoomRegistry, SfuConfig, WorkerPool, WorkerSettings};
//!
//! let engine = LoopbackEngine::new();
//! let pool = Arc::new(WorkerPool::start(&engine, 4, &WorkerSettings::default()).await?);
//! let registry = RoomRegistry::new(SfuConfig::default(), pool, Arc::new(MemoryMessageStore::new()));
//! let room = registry.join(&room_id, peer_id, "Alice".into(), true, sink).await?;
//! ```

mod broadcast;
mod config;
mod engine;
mod error;
mod loopback;
mod peer;
mod registry;
mod room;
mod store;
mod worker_pool;

pub use broadcast::{broadcast, BroadcastReport};
pub use config::SfuConfig;
pub use engine::{
    EngineResult, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaWorker,
    TransportOptions, WebRtcTransport, WorkerSettings,
};
pub use error::{EngineError, Result, SendError, SfuError, StoreError};
pub use loopback::{
    default_capabilities, LoopbackConsumer, LoopbackEngine, LoopbackProducer, LoopbackRouter,
    LoopbackTransport, LoopbackWorker,
};
pub use peer::{ChannelSink, ClosedResources, Peer, PeerSink};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{PeerRemoval, Room, RoomStats};
pub use store::{MemoryMessageStore, MessageStore};
pub use worker_pool::{WorkerDeath, WorkerPool};
