//! Room timing configuration.

use std::time::Duration;

/// Timing knobs for a room. One value serves as both the failure-detector
/// window and the delay of every protocol timeout.
#[derive(Clone, Copy, Debug)]
pub struct RoomConfig {
    /// Interval between heartbeats to each peer.
    pub beat_rate: Duration,
    /// A peer counts as up while its last heartbeat is younger than this.
    /// Also the delay applied to every scheduled protocol timeout.
    pub alive_threshold: Duration,
    /// How long a freshly started replica waits before deciding whether to
    /// promote itself to coordinator.
    pub determine_coordinator_after: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            beat_rate: Duration::from_millis(100),
            alive_threshold: Duration::from_millis(1000),
            determine_coordinator_after: Duration::from_millis(3000),
        }
    }
}

impl RoomConfig {
    #[must_use]
    pub fn alive_threshold_ms(&self) -> u64 {
        self.alive_threshold.as_millis().try_into().unwrap_or(u64::MAX)
    }
}
