//! Media engine capability
//!
//! The forwarding engine (codec negotiation, RTP/SRTP, congestion control) is
//! an external collaborator. The orchestration layer only talks to it through
//! these traits: a factory of workers, routers, transports, producers and
//! consumers, plus capability negotiation and worker death notification.

use async_trait::async_trait;
use livecast_proto::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId,
};
use std::sync::Arc;

use crate::error::EngineError;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Settings handed to every worker at spawn time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// Listen configuration for WebRTC transports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_ip: String,
    /// Address advertised in ICE candidates instead of `listen_ip` (NAT)
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> &str;

    async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>>;

    /// Resolves with a reason once the worker has died
    async fn died(&self) -> String;

    async fn close(&self);
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> EngineResult<Arc<dyn WebRtcTransport>>;

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Complete the DTLS handshake with the remote fingerprint
    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}
