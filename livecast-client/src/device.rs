//! Local media device capability
//!
//! The browser-side media stack (capture, encoders, ICE/DTLS agent) is an
//! external collaborator. The driver reaches it through [`MediaDevice`] and
//! the [`LocalTransport`]s it creates. [`LoopbackDevice`] is a complete
//! in-process implementation that negotiates parameters from the router's
//! capabilities without moving any media.

use async_trait::async_trait;
use livecast_proto::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    PeerId, ProducerId, RtpCapabilities, RtpCodecParameters, RtpParameters, TransportDirection,
    TransportId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{ClientError, Result};

/// A captured local track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// Server-issued transport parameters from `transport-created`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// A consumer as announced by `consumer-created`
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConsumer {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Raw transport statistics as reported by the local stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    /// bits per second, 0 when unknown
    pub available_outgoing_bitrate: u64,
    /// bits per second, 0 when unknown
    pub available_incoming_bitrate: u64,
    /// Fraction of packets lost, 0.0 to 1.0
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub round_trip_time_ms: f64,
}

#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's capabilities. Required before anything else.
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// What this device can receive, sent with every `consume`
    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_transport(&self, info: TransportInfo) -> Result<Arc<dyn LocalTransport>>;
}

#[async_trait]
pub trait LocalTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> TransportDirection;

    /// DTLS parameters to send in `connect-transport`
    fn local_dtls_parameters(&self) -> DtlsParameters;

    /// Negotiate a track locally, yielding the RTP parameters to announce in
    /// `produce`
    async fn send_track(&self, track: &LocalTrack) -> Result<RtpParameters>;

    /// Bind the server-issued producer id to the track, resolving the local
    /// produce call
    fn attach_producer(&self, producer_id: &ProducerId, track: &LocalTrack);

    /// Set up the local receive track for a consumer
    async fn receive(&self, consumer: &RemoteConsumer) -> Result<()>;

    async fn stats(&self) -> Result<TransportStats>;

    async fn close(&self);
}

/// In-process [`MediaDevice`]
#[derive(Default)]
pub struct LoopbackDevice {
    capabilities: Mutex<Option<RtpCapabilities>>,
    stats: Arc<Mutex<TransportStats>>,
}

impl LoopbackDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics every transport of this device reports from now on
    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }
}

#[async_trait]
impl MediaDevice for LoopbackDevice {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<()> {
        if router_capabilities.is_empty() {
            return Err(ClientError::Device("router offers no codecs".to_string()));
        }
        *self.capabilities.lock() = Some(router_capabilities.clone());
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.capabilities.lock().is_some()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.lock().clone().unwrap_or_default()
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        self.capabilities
            .lock()
            .as_ref()
            .is_some_and(|caps| caps.has_kind(kind))
    }

    async fn create_transport(&self, info: TransportInfo) -> Result<Arc<dyn LocalTransport>> {
        let capabilities = self
            .capabilities
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Device("device not loaded".to_string()))?;
        Ok(Arc::new(LoopbackLocalTransport {
            info,
            capabilities,
            stats: Arc::clone(&self.stats),
            mid: AtomicU32::new(0),
            producers: Mutex::new(HashMap::new()),
            receiving: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct LoopbackLocalTransport {
    info: TransportInfo,
    capabilities: RtpCapabilities,
    stats: Arc<Mutex<TransportStats>>,
    mid: AtomicU32,
    producers: Mutex<HashMap<ProducerId, LocalTrack>>,
    receiving: Mutex<Vec<ConsumerId>>,
    closed: AtomicBool,
}

impl LoopbackLocalTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Device(format!("transport {} is closed", self.info.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalTransport for LoopbackLocalTransport {
    fn id(&self) -> &TransportId {
        &self.info.id
    }

    fn direction(&self) -> TransportDirection {
        self.info.direction
    }

    fn local_dtls_parameters(&self) -> DtlsParameters {
        // Mirror the remote fingerprint; the loopback stack has no real
        // certificate
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: self
                .info
                .dtls_parameters
                .fingerprints
                .first()
                .cloned()
                .map_or_else(
                    || {
                        vec![DtlsFingerprint {
                            algorithm: "sha-256".to_string(),
                            value: "00".to_string(),
                        }]
                    },
                    |fingerprint| vec![fingerprint],
                ),
        }
    }

    async fn send_track(&self, track: &LocalTrack) -> Result<RtpParameters> {
        self.ensure_open()?;
        if self.info.direction != TransportDirection::Send {
            return Err(ClientError::Device("cannot send on a receive transport".to_string()));
        }
        let codec = self
            .capabilities
            .codecs
            .iter()
            .find(|codec| codec.kind == track.kind)
            .ok_or(ClientError::CannotProduce(track.kind))?;

        let mid = self.mid.fetch_add(1, Ordering::Relaxed);
        Ok(RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type.unwrap_or(96),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![serde_json::json!({ "ssrc": 1000 + mid })],
            rtcp: Some(serde_json::json!({ "cname": track.id })),
        })
    }

    fn attach_producer(&self, producer_id: &ProducerId, track: &LocalTrack) {
        self.producers.lock().insert(producer_id.clone(), track.clone());
    }

    async fn receive(&self, consumer: &RemoteConsumer) -> Result<()> {
        self.ensure_open()?;
        if self.info.direction != TransportDirection::Recv {
            return Err(ClientError::Device("cannot receive on a send transport".to_string()));
        }
        self.receiving.lock().push(consumer.consumer_id.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.ensure_open()?;
        Ok(*self.stats.lock())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.producers.lock().clear();
        self.receiving.lock().clear();
    }
}
