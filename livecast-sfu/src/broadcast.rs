//! Room broadcast dispatcher

use livecast_proto::{PeerId, ServerMessage};
use tracing::debug;

use crate::peer::{encode, Peer};

/// Outcome of a fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Send `message` to every peer except `exclude`.
///
/// The message is serialized once. A failed send to one peer is logged and
/// never stops delivery to the remaining peers.
pub fn broadcast<'a>(
    peers: impl IntoIterator<Item = &'a Peer>,
    message: &ServerMessage,
    exclude: Option<&PeerId>,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    let Some(frame) = encode(message) else {
        return report;
    };

    for peer in peers {
        if exclude.is_some_and(|excluded| excluded == peer.id()) {
            continue;
        }
        if peer.send_frame(frame.clone(), message.kind()) {
            report.delivered += 1;
        } else {
            report.failed += 1;
        }
    }

    debug!(
        kind = message.kind(),
        delivered = report.delivered,
        failed = report.failed,
        "Broadcast dispatched"
    );
    report
}
