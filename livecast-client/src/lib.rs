//! Livecast client signaling
//!
//! Drives one participant through the signaling protocol: connect, join,
//! negotiate a send and a receive transport, then publish and subscribe.
//! Local media is reached through the [`MediaDevice`] capability.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_client::{LocalTrack, LoopbackDevice, SignalingDriver};
//!
//! let (mut driver, mut events) = SignalingDriver::new(Arc::new(LoopbackDevice::new()));
//! driver.connect("ws://127.0.0.1:3000/ws").await?;
//! driver.join(RoomId::from("lobby"), "Alice", true).await?;
//! driver.produce(LocalTrack::new("mic", MediaKind::Audio)).await?;
//! while driver.process_next().await? {}
//! ```

mod channel;
mod device;
mod driver;
mod error;
mod network_monitor;

pub use channel::{MemoryChannel, MemoryChannelRemote, SignalingChannel, WsChannel};
pub use device::{
    LocalTrack, LocalTransport, LoopbackDevice, LoopbackLocalTransport, MediaDevice,
    RemoteConsumer, TransportInfo, TransportStats,
};
pub use driver::{ClientEvent, DriverOptions, DriverState, RemotePeer, SignalingDriver};
pub use error::{ClientError, Result};
pub use network_monitor::{
    classify, NetworkQualityMonitor, NetworkStats, QualityBand, QualityChange, StatsSource,
    TransportStatsSource, DEFAULT_POLL_INTERVAL, HISTORY_LEN,
};
