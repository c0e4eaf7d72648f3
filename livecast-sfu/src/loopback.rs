//! In-process loopback media engine
//!
//! A deterministic engine implementation that performs full capability
//! negotiation and resource bookkeeping without touching the network. It is
//! what the server runs when no external forwarding engine is attached, and
//! what the test suites drive.

use async_trait::async_trait;
use dashmap::DashMap;
use livecast_proto::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    ProducerId, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportId,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{
    EngineResult, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaWorker,
    TransportOptions, WebRtcTransport, WorkerSettings,
};
use crate::error::EngineError;

/// Codecs every loopback router advertises
#[must_use]
pub fn default_capabilities() -> RtpCapabilities {
    let video_feedback = vec![
        RtcpFeedback::new("nack", ""),
        RtcpFeedback::new("nack", "pli"),
        RtcpFeedback::new("ccm", "fir"),
        RtcpFeedback::new("goog-remb", ""),
        RtcpFeedback::new("transport-cc", ""),
    ];

    let mut h264_params = Map::new();
    h264_params.insert("packetization-mode".to_string(), Value::from(1));
    h264_params.insert("profile-level-id".to_string(), Value::from("42e01f"));
    h264_params.insert("level-asymmetry-allowed".to_string(), Value::from(1));

    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: vec![RtcpFeedback::new("transport-cc", "")],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: video_feedback.clone(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                preferred_payload_type: Some(102),
                clock_rate: 90000,
                channels: None,
                parameters: h264_params,
                rtcp_feedback: video_feedback,
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// Round-robin allocator over the configured RTC port range
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortAllocator {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            span: u32::from(max.saturating_sub(min)) + 1,
            next: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        // offset < span <= u16::MAX + 1 - min, so the sum fits
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.min)
    }
}

type RouterList = Mutex<Vec<Arc<LoopbackRouter>>>;
type TransportList = Mutex<Vec<Arc<LoopbackTransport>>>;

/// Factory of loopback workers
#[derive(Default)]
pub struct LoopbackEngine {
    worker_seq: AtomicU64,
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every worker spawned so far, for fault injection
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<LoopbackWorker>> {
        self.workers.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Other(format!(
                "invalid RTC port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let (death, _) = watch::channel(None);
        let worker = Arc::new(LoopbackWorker {
            id: format!("loopback-worker-{seq}"),
            ports: Arc::new(PortAllocator::new(settings.rtc_min_port, settings.rtc_max_port)),
            routers: Arc::new(Mutex::new(Vec::new())),
            death,
            closed: AtomicBool::new(false),
        });
        self.workers.lock().push(Arc::clone(&worker));

        debug!(worker_id = %worker.id, "Loopback worker started");
        Ok(worker)
    }
}

pub struct LoopbackWorker {
    id: String,
    ports: Arc<PortAllocator>,
    /// Open routers; a router removes itself on close
    routers: Arc<RouterList>,
    death: watch::Sender<Option<String>>,
    closed: AtomicBool,
}

impl LoopbackWorker {
    /// Simulate the worker process dying
    pub fn kill(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(worker_id = %self.id, reason = %reason, "Loopback worker killed");
        self.closed.store(true, Ordering::SeqCst);
        for router in self.routers.lock().drain(..) {
            router.shared.closed.store(true, Ordering::SeqCst);
        }
        self.death.send_replace(Some(reason));
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_router(&self) -> EngineResult<Arc<dyn MediaRouter>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::WorkerClosed(self.id.clone()));
        }

        let router = Arc::new(LoopbackRouter {
            shared: Arc::new(RouterShared {
                id: Uuid::new_v4().to_string(),
                closed: AtomicBool::new(false),
                producers: DashMap::new(),
                capabilities: default_capabilities(),
            }),
            ports: Arc::clone(&self.ports),
            worker: Arc::downgrade(&self.routers),
            transports: Arc::new(Mutex::new(Vec::new())),
        });
        self.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }

    async fn died(&self) -> String {
        let mut rx = self.death.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.as_deref().unwrap_or_default().to_string(),
            Err(_) => "worker handle dropped".to_string(),
        };
        reason
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let routers: Vec<_> = self.routers.lock().drain(..).collect();
        for router in routers {
            router.close().await;
        }
    }
}

struct RouterShared {
    id: String,
    closed: AtomicBool,
    producers: DashMap<ProducerId, Arc<LoopbackProducer>>,
    capabilities: RtpCapabilities,
}

impl RouterShared {
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.producers.get(producer_id).is_some_and(|producer| {
            !producer.is_closed()
                && producer
                    .rtp_parameters
                    .primary_codec()
                    .is_some_and(|codec| rtp_capabilities.supports(codec))
        })
    }
}

pub struct LoopbackRouter {
    shared: Arc<RouterShared>,
    ports: Arc<PortAllocator>,
    worker: Weak<RouterList>,
    /// Open transports; a transport removes itself on close
    transports: Arc<TransportList>,
}

impl LoopbackRouter {
    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.shared.producers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> EngineResult<Arc<dyn WebRtcTransport>> {
        if self.is_closed() {
            return Err(EngineError::RouterClosed(self.shared.id.clone()));
        }

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.ports.allocate();

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: if options.prefer_udp { 1_076_302_079 } else { 1_076_302_078 },
                ip: ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: if options.prefer_udp { 1_076_276_479 } else { 1_076_302_079 },
                ip,
                protocol: "tcp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
        }

        let ufrag = Uuid::new_v4().simple().to_string();
        let transport = Arc::new(LoopbackTransport {
            id: TransportId::new(Uuid::new_v4().to_string()),
            router: Arc::clone(&self.shared),
            siblings: Arc::downgrade(&self.transports),
            ice_parameters: IceParameters {
                username_fragment: ufrag[..16].to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            consumer_seq: AtomicU64::new(0),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        !self.is_closed() && self.shared.can_consume(producer_id, rtp_capabilities)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let transports: Vec<_> = self.transports.lock().drain(..).collect();
        for transport in transports {
            transport.close().await;
        }
        self.shared.producers.clear();
        if let Some(routers) = self.worker.upgrade() {
            routers.lock().retain(|router| router.shared.id != self.shared.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn random_fingerprint() -> DtlsFingerprint {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    let value = digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

pub struct LoopbackTransport {
    id: TransportId,
    router: Arc<RouterShared>,
    siblings: Weak<TransportList>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    consumer_seq: AtomicU64,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id.to_string()));
        }
        if self.router.closed.load(Ordering::SeqCst) {
            return Err(EngineError::RouterClosed(self.router.id.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebRtcTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidDtls("no fingerprints".to_string()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected(self.id.to_string()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        self.ensure_open()?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or(EngineError::UnsupportedCodec)?;
        let supported = self.router.capabilities.codecs.iter().any(|cap| {
            cap.kind == kind
                && cap.mime_type.eq_ignore_ascii_case(&codec.mime_type)
                && cap.clock_rate == codec.clock_rate
        });
        if !supported {
            return Err(EngineError::UnsupportedCodec);
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(Uuid::new_v4().to_string()),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&self.router),
            closed: AtomicBool::new(false),
        });
        self.router
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;

        let producer = self
            .router
            .producers
            .get(producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.to_string()))?;

        if !self.router.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::CannotConsume(producer_id.to_string()));
        }

        let codecs = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| rtp_capabilities.supports(codec))
            .cloned()
            .collect();

        let mid = self.consumer_seq.fetch_add(1, Ordering::Relaxed);
        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(Uuid::new_v4().to_string()),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid.to_string()),
                codecs,
                header_extensions: Vec::new(),
                encodings: producer.rtp_parameters.encodings.clone(),
                rtcp: producer.rtp_parameters.rtcp.clone(),
            },
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close().await;
        }
        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close().await;
        }
        if let Some(transports) = self.siblings.upgrade() {
            transports.lock().retain(|transport| transport.id != self.id);
        }
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<RouterShared>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Other(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecast_proto::RtpCodecParameters;

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..RtpParameters::default()
        }
    }

    async fn router() -> Arc<dyn MediaRouter> {
        let engine = LoopbackEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        worker.create_router().await.unwrap()
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![random_fingerprint()],
        }
    }

    #[tokio::test]
    async fn test_transport_advertises_announced_ip() {
        let router = router().await;
        let options = TransportOptions {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: Some("203.0.113.7".to_string()),
            ..TransportOptions::default()
        };

        let transport = router.create_webrtc_transport(&options).await.unwrap();
        let candidates = transport.ice_candidates();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.ip == "203.0.113.7"));
        assert!((40000..=49999).contains(&candidates[0].port));
        assert_eq!(transport.dtls_parameters().fingerprints[0].value.len(), 95);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let router = router().await;
        let transport = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();

        transport.connect(dtls()).await.unwrap();
        assert!(matches!(
            transport.connect(dtls()).await,
            Err(EngineError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_can_consume_requires_matching_codec() {
        let router = router().await;
        let send = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();

        assert!(router.can_consume(producer.id(), &default_capabilities()));

        let audio_only = RtpCapabilities {
            codecs: default_capabilities()
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(!router.can_consume(&ProducerId::from("missing"), &default_capabilities()));

        let recv = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            recv.consume(producer.id(), &audio_only, true).await,
            Err(EngineError::CannotConsume(_))
        ));
    }

    #[tokio::test]
    async fn test_consumer_starts_paused_until_resumed() {
        let router = router().await;
        let send = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();

        let recv = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &default_capabilities(), true)
            .await
            .unwrap();

        assert!(consumer.is_paused());
        assert_eq!(consumer.kind(), MediaKind::Video);
        consumer.resume().await.unwrap();
        assert!(!consumer.is_paused());
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let router = router().await;
        let send = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();

        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/AV1".to_string();
        assert!(matches!(
            send.produce(MediaKind::Video, params).await,
            Err(EngineError::UnsupportedCodec)
        ));

        // VP8 announced as audio is a kind mismatch
        assert!(matches!(
            send.produce(MediaKind::Audio, vp8_parameters()).await,
            Err(EngineError::UnsupportedCodec)
        ));
    }

    #[tokio::test]
    async fn test_closed_producer_is_not_consumable() {
        let router = router().await;
        let send = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();

        producer.close().await;
        assert!(!router.can_consume(producer.id(), &default_capabilities()));
    }

    #[tokio::test]
    async fn test_killed_worker_reports_death() {
        let engine = LoopbackEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        let router = worker.create_router().await.unwrap();

        engine.workers()[0].kill("segfault");

        assert_eq!(worker.died().await, "segfault");
        assert!(router.is_closed());
        assert!(matches!(
            worker.create_router().await,
            Err(EngineError::WorkerClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_resources_are_released() {
        let engine = LoopbackEngine::new();
        let worker = engine
            .create_worker(&WorkerSettings::default())
            .await
            .unwrap();
        let router = worker.create_router().await.unwrap();
        let kept = worker.create_router().await.unwrap();
        let loopback = Arc::clone(&engine.workers()[0]);
        assert_eq!(loopback.router_count(), 2);

        let send = router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        router
            .create_webrtc_transport(&TransportOptions::default())
            .await
            .unwrap();
        let inner = Arc::clone(&loopback.routers.lock()[0]);
        assert_eq!(inner.transport_count(), 2);

        send.close().await;
        assert_eq!(inner.transport_count(), 1);

        router.close().await;
        assert_eq!(inner.transport_count(), 0);
        assert_eq!(loopback.router_count(), 1);
        assert_eq!(loopback.routers.lock()[0].id(), kept.id());
    }

    #[test]
    fn test_port_allocator_wraps() {
        let ports = PortAllocator::new(5000, 5001);
        assert_eq!(ports.allocate(), 5000);
        assert_eq!(ports.allocate(), 5001);
        assert_eq!(ports.allocate(), 5000);
    }
}
