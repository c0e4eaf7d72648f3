//! Network Quality Monitoring
//!
//! Polls a transport's statistics and classifies the connection for UI
//! feedback. Advisory only: nothing on the server depends on it.
//!
//! ## Quality bands
//! A band applies when the bitrate floor, the packet-loss ceiling and the
//! jitter ceiling all hold. Bands are tried best first.
//! - Excellent: >= 1 Mbps, loss <= 1%, jitter <= 30ms
//! - Good: >= 500 kbps, loss <= 3%, jitter <= 50ms
//! - Poor: >= 150 kbps, loss <= 8%, jitter <= 100ms
//! - Very poor: anything else
//!
//! The bitrate compared against the floor is the lower of the available
//! outgoing and incoming bitrates; a direction reporting 0 is unknown and
//! ignored.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::{LocalTransport, TransportStats};
use crate::error::Result;

/// Samples retained for inspection
pub const HISTORY_LEN: usize = 10;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityBand {
    Excellent,
    Good,
    Poor,
    VeryPoor,
}

struct BandThreshold {
    band: QualityBand,
    min_bitrate: u64,
    max_packet_loss: f64,
    max_jitter_ms: f64,
}

const BANDS: [BandThreshold; 3] = [
    BandThreshold {
        band: QualityBand::Excellent,
        min_bitrate: 1_000_000,
        max_packet_loss: 0.01,
        max_jitter_ms: 30.0,
    },
    BandThreshold {
        band: QualityBand::Good,
        min_bitrate: 500_000,
        max_packet_loss: 0.03,
        max_jitter_ms: 50.0,
    },
    BandThreshold {
        band: QualityBand::Poor,
        min_bitrate: 150_000,
        max_packet_loss: 0.08,
        max_jitter_ms: 100.0,
    },
];

/// One timestamped sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub timestamp: DateTime<Utc>,
    pub outgoing_bitrate: u64,
    pub incoming_bitrate: u64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub rtt_ms: f64,
}

impl NetworkStats {
    #[must_use]
    pub fn from_transport(stats: &TransportStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            outgoing_bitrate: stats.available_outgoing_bitrate,
            incoming_bitrate: stats.available_incoming_bitrate,
            packet_loss: stats.packet_loss,
            jitter_ms: stats.jitter_ms,
            rtt_ms: stats.round_trip_time_ms,
        }
    }

    /// Lower of the known directional bitrates
    fn effective_bitrate(&self) -> Option<u64> {
        [self.outgoing_bitrate, self.incoming_bitrate]
            .into_iter()
            .filter(|&bitrate| bitrate > 0)
            .min()
    }
}

#[must_use]
pub fn classify(stats: &NetworkStats) -> QualityBand {
    let bitrate = stats.effective_bitrate();
    BANDS
        .iter()
        .find(|threshold| {
            bitrate.is_none_or(|bitrate| bitrate >= threshold.min_bitrate)
                && stats.packet_loss <= threshold.max_packet_loss
                && stats.jitter_ms <= threshold.max_jitter_ms
        })
        .map_or(QualityBand::VeryPoor, |threshold| threshold.band)
}

/// Emitted when the classified band changes
#[derive(Debug, Clone, PartialEq)]
pub struct QualityChange {
    /// `None` for the first classification
    pub previous: Option<QualityBand>,
    pub current: QualityBand,
    pub stats: NetworkStats,
}

/// Where samples come from
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn sample(&self) -> Result<TransportStats>;
}

/// Samples a local transport
pub struct TransportStatsSource(pub Arc<dyn LocalTransport>);

#[async_trait]
impl StatsSource for TransportStatsSource {
    async fn sample(&self) -> Result<TransportStats> {
        self.0.stats().await
    }
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<NetworkStats>,
    band: Option<QualityBand>,
}

pub struct NetworkQualityMonitor {
    source: Arc<dyn StatsSource>,
    poll_interval: Duration,
    state: Mutex<MonitorState>,
    changes: broadcast::Sender<QualityChange>,
}

impl NetworkQualityMonitor {
    pub fn new(source: Arc<dyn StatsSource>) -> Arc<Self> {
        Self::with_interval(source, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(source: Arc<dyn StatsSource>, poll_interval: Duration) -> Arc<Self> {
        let (changes, _) = broadcast::channel(16);
        Arc::new(Self {
            source,
            poll_interval,
            state: Mutex::new(MonitorState::default()),
            changes,
        })
    }

    /// Register a listener for band changes
    pub fn subscribe(&self) -> broadcast::Receiver<QualityChange> {
        self.changes.subscribe()
    }

    /// Add one sample; returns the change it caused, if any
    pub fn record(&self, stats: TransportStats) -> Option<QualityChange> {
        let sample = NetworkStats::from_transport(&stats, Utc::now());
        let current = classify(&sample);

        let previous = {
            let mut state = self.state.lock();
            state.history.push_back(sample.clone());
            while state.history.len() > HISTORY_LEN {
                state.history.pop_front();
            }
            if state.band == Some(current) {
                return None;
            }
            state.band.replace(current)
        };

        debug!(?previous, ?current, "Network quality changed");
        let change = QualityChange {
            previous,
            current,
            stats: sample,
        };
        // No listeners is fine
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    /// Take one sample from the source
    pub async fn poll_once(&self) -> Result<Option<QualityChange>> {
        let stats = self.source.sample().await?;
        Ok(self.record(stats))
    }

    #[must_use]
    pub fn current_band(&self) -> Option<QualityBand> {
        self.state.lock().band
    }

    /// Retained samples, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<NetworkStats> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Poll on the configured interval until cancelled
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = monitor.poll_interval.as_millis(), "Network quality monitor started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.poll_once().await {
                            debug!(error = %e, "Skipping network sample");
                        }
                    }
                }
            }
            debug!("Network quality monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stats(bitrate: u64, loss: f64, jitter: f64) -> TransportStats {
        TransportStats {
            available_outgoing_bitrate: bitrate,
            available_incoming_bitrate: bitrate,
            packet_loss: loss,
            jitter_ms: jitter,
            round_trip_time_ms: 40.0,
        }
    }

    fn sample(stats: TransportStats) -> NetworkStats {
        NetworkStats::from_transport(&stats, Utc::now())
    }

    struct FixedSource {
        stats: Mutex<TransportStats>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatsSource for FixedSource {
        async fn sample(&self) -> Result<TransportStats> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.stats.lock())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl StatsSource for FailingSource {
        async fn sample(&self) -> Result<TransportStats> {
            Err(ClientError::Device("no transport".to_string()))
        }
    }

    #[test]
    fn test_classify_bands() {
        assert_eq!(classify(&sample(stats(2_000_000, 0.0, 10.0))), QualityBand::Excellent);
        assert_eq!(classify(&sample(stats(800_000, 0.0, 10.0))), QualityBand::Good);
        assert_eq!(classify(&sample(stats(2_000_000, 0.02, 10.0))), QualityBand::Good);
        assert_eq!(classify(&sample(stats(2_000_000, 0.0, 80.0))), QualityBand::Poor);
        assert_eq!(classify(&sample(stats(100_000, 0.0, 10.0))), QualityBand::VeryPoor);
        assert_eq!(classify(&sample(stats(2_000_000, 0.2, 10.0))), QualityBand::VeryPoor);
    }

    #[test]
    fn test_bitrate_floor_uses_lower_known_direction() {
        let mut s = stats(2_000_000, 0.0, 10.0);
        s.available_incoming_bitrate = 600_000;
        assert_eq!(classify(&sample(s)), QualityBand::Good);

        s.available_incoming_bitrate = 0;
        assert_eq!(classify(&sample(s)), QualityBand::Excellent);

        s.available_outgoing_bitrate = 0;
        assert_eq!(classify(&sample(s)), QualityBand::Excellent);
    }

    #[test]
    fn test_only_band_changes_notify() {
        let monitor = NetworkQualityMonitor::new(Arc::new(FailingSource));
        let mut rx = monitor.subscribe();

        let changes: Vec<_> = (0..10)
            .filter_map(|_| monitor.record(stats(700_000, 0.01, 20.0)))
            .collect();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, None);
        assert_eq!(changes[0].current, QualityBand::Good);

        let change = monitor.record(stats(100_000, 0.1, 200.0)).unwrap();
        assert_eq!(change.previous, Some(QualityBand::Good));
        assert_eq!(change.current, QualityBand::VeryPoor);

        assert_eq!(rx.try_recv().unwrap().current, QualityBand::Good);
        assert_eq!(rx.try_recv().unwrap().current, QualityBand::VeryPoor);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let monitor = NetworkQualityMonitor::new(Arc::new(FailingSource));
        for i in 0..15 {
            monitor.record(stats(1_000_000 + i, 0.0, 10.0));
        }
        let history = monitor.history();
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0].outgoing_bitrate, 1_000_005);
        assert_eq!(history[9].outgoing_bitrate, 1_000_014);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_loop_notifies_once_per_band() {
        let source = Arc::new(FixedSource {
            stats: Mutex::new(stats(700_000, 0.01, 20.0)),
            calls: AtomicUsize::new(0),
        });
        let monitor = NetworkQualityMonitor::new(Arc::clone(&source) as Arc<dyn StatsSource>);
        let mut rx = monitor.subscribe();
        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());

        // Ten polls at 0s, 3s, ..., 27s
        tokio::time::sleep(Duration::from_millis(28_500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 10);
        assert_eq!(rx.try_recv().unwrap().current, QualityBand::Good);
        assert!(rx.try_recv().is_err());

        *source.stats.lock() = stats(50_000, 0.2, 300.0);
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
        assert_eq!(rx.try_recv().unwrap().current, QualityBand::VeryPoor);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_samples_device_transport() {
        use crate::device::{LoopbackDevice, MediaDevice, TransportInfo};
        use livecast_proto::{
            DtlsParameters, DtlsRole, IceParameters, MediaKind, RtpCapabilities,
            RtpCodecCapability, TransportDirection, TransportId,
        };

        let device = LoopbackDevice::new();
        device
            .load(&RtpCapabilities {
                codecs: vec![RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    preferred_payload_type: Some(100),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: serde_json::Map::new(),
                    rtcp_feedback: Vec::new(),
                }],
                header_extensions: Vec::new(),
            })
            .await
            .unwrap();
        let transport = device
            .create_transport(TransportInfo {
                id: TransportId::from("send"),
                direction: TransportDirection::Send,
                ice_parameters: IceParameters {
                    username_fragment: "u".to_string(),
                    password: "p".to_string(),
                    ice_lite: true,
                },
                ice_candidates: Vec::new(),
                dtls_parameters: DtlsParameters {
                    role: DtlsRole::Auto,
                    fingerprints: Vec::new(),
                },
            })
            .await
            .unwrap();

        let source = TransportStatsSource(Arc::clone(&transport));
        let monitor = NetworkQualityMonitor::new(Arc::new(source));
        device.set_stats(stats(2_000_000, 0.0, 10.0));
        let change = monitor.poll_once().await.unwrap().unwrap();
        assert_eq!(change.current, QualityBand::Excellent);
        assert_eq!(change.stats.rtt_ms, 40.0);

        device.set_stats(stats(300_000, 0.05, 60.0));
        let change = monitor.poll_once().await.unwrap().unwrap();
        assert_eq!(change.previous, Some(QualityBand::Excellent));
        assert_eq!(change.current, QualityBand::Poor);

        transport.close().await;
        assert!(monitor.poll_once().await.is_err());
        assert_eq!(monitor.history().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_sample_is_skipped() {
        let monitor = NetworkQualityMonitor::new(Arc::new(FailingSource));
        assert!(monitor.poll_once().await.is_err());
        assert!(monitor.current_band().is_none());
        assert!(monitor.history().is_empty());
    }
}
