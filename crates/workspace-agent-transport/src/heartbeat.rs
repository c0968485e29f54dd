//! Per-connection liveness probing.

use std::time::Duration;

use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::protocol::OutboundMessage;

/// Floor for the probe period; `interval` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Consecutive probes sent without an acknowledgment.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTracker {
    missed: u32,
    threshold: u32,
}

impl HeartbeatTracker {
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            missed: 0,
            threshold,
        }
    }

    #[must_use]
    pub const fn missed(&self) -> u32 {
        self.missed
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.missed >= self.threshold
    }

    pub const fn record_probe(&mut self) {
        self.missed = self.missed.saturating_add(1);
    }

    pub const fn acknowledge(&mut self) {
        self.missed = 0;
    }
}

/// How the heartbeat task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The connection ended for another reason.
    Stopped,
    /// Too many probes went unanswered; the connection was cancelled.
    TimedOut,
}

/// Probe the server every `period` until the connection ends.
///
/// On each tick the task first checks the tracker: once `threshold`
/// probes are outstanding it cancels `connection` instead of sending
/// another. Acks arrive on `acks` from the receive loop.
pub async fn run_heartbeat(
    period: Duration,
    threshold: u32,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    mut acks: mpsc::UnboundedReceiver<()>,
    connection: CancellationToken,
) -> HeartbeatOutcome {
    let mut tracker = HeartbeatTracker::new(threshold.max(1));
    let mut ticker = interval(period.max(MIN_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = connection.cancelled() => return HeartbeatOutcome::Stopped,
            Some(()) = acks.recv() => tracker.acknowledge(),
            _ = ticker.tick() => {
                if tracker.is_exhausted() {
                    tracing::warn!(missed = tracker.missed(), "Heartbeat unanswered, dropping connection");
                    connection.cancel();
                    return HeartbeatOutcome::TimedOut;
                }
                if outbound.send(OutboundMessage::heartbeat_now()).is_err() {
                    return HeartbeatOutcome::Stopped;
                }
                tracker.record_probe();
                tracing::trace!(missed = tracker.missed(), "Heartbeat sent");
            }
        }
    }
}
