pub mod tracker;

pub use tracker::PendingTracker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::trace;

use crate::probe::{ProbeResult, ResultHandler};

/// Send-time observation extracted from a qualifying probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendTimeUpdate {
    pub identifier: u64,
    pub send_time: DateTime<Utc>,
}

/// Bridges probe workers to the event loop.
///
/// Workers invoke the handler on their own threads; the handler filters
/// out everything but the authoritative send event and posts the rest onto
/// a channel the event loop drains into the [`PendingTracker`]. Keeping
/// tracker mutation on the loop side leaves the worker path free of locks
/// other than the channel's own.
pub struct Correlator {
    tx: mpsc::UnboundedSender<SendTimeUpdate>,
}

impl Correlator {
    /// Create a correlator and the receiving end the event loop consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SendTimeUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Build the per-service result handler.
    ///
    /// Only the first hop of the first round carries the send time that
    /// identifies the probe run; later hops and rounds reuse the same
    /// conceptual send event and are dropped here.
    pub fn handler(&self) -> ResultHandler {
        let tx = self.tx.clone();

        Box::new(move |result: ProbeResult| {
            if result.round != 0 || result.hop != 1 {
                return;
            }

            trace!(
                identifier = result.destination.identifier,
                source = %result.source,
                "observed authoritative send time",
            );

            let _ = tx.send(SendTimeUpdate {
                identifier: result.destination.identifier,
                send_time: result.send_time,
            });
        })
    }
}

/// Apply one drained update to the tracker.
pub fn apply_update(tracker: &Arc<PendingTracker>, update: SendTimeUpdate) {
    tracker.record_send_time(update.identifier, update.send_time);
}
