use std::time::Duration;

use tokio::time::Instant;

/// Decides when a keepalive is due on an otherwise silent stream.
///
/// The scheduler holds no timer itself; the owner polls it from its own tick
/// so the timer lives and dies with the owning task.
#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    interval: Duration,
    last_activity: Instant,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_activity: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Returns true when a heartbeat should be emitted, restarting the
    /// inactivity clock so the next one is a full interval away.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_activity) >= self.interval {
            self.last_activity = now;
            true
        } else {
            false
        }
    }
}
