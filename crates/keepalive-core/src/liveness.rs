//! Keepalive liveness state machine.
//!
//! Pure bookkeeping with no I/O: the session control task feeds it keepalive
//! arrivals and transmit/receive failures together with the current time, and
//! acts on the transitions it returns.
//!
//! ```text
//!            keepalive received
//!   DOWN ───────────────────────────▶ UP
//!    ▲                                │
//!    │   tx failure, or rx failure    │
//!    └────── with misses ≥ threshold ◀┘
//! ```
//!
//! Each transition is reported once; repeated input in the same state only
//! updates counters.

use crate::events::PeerState;
use serde::Serialize;

/// Snapshot of a session's keepalive counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveStats {
    /// Receive misses since the last keepalive arrived
    pub consecutive_misses: u32,
    /// Every transmit or receive failure over the session lifetime
    pub total_misses: u64,
    /// Last DOWN → UP transition (ms since Unix epoch)
    pub last_change_up: Option<u64>,
    /// Last UP → DOWN transition (ms since Unix epoch)
    pub last_change_down: Option<u64>,
}

/// Liveness tracker for a single remote peer.
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Consecutive receive misses that take the peer down
    threshold: u32,
    alive: bool,
    stats: KeepaliveStats,
}

impl Liveness {
    /// Create a tracker in the DOWN state.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            alive: false,
            stats: KeepaliveStats::default(),
        }
    }

    /// Miss threshold derived from the timers: `floor(dead_interval / interval)`.
    ///
    /// A zero interval yields a zero threshold (first miss goes down).
    pub fn threshold_for(interval_ms: u32, dead_interval_ms: u32) -> u32 {
        dead_interval_ms.checked_div(interval_ms).unwrap_or(0)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn state(&self) -> PeerState {
        if self.alive {
            PeerState::Up
        } else {
            PeerState::Down
        }
    }

    pub fn stats(&self) -> KeepaliveStats {
        self.stats
    }

    /// A well-formed keepalive arrived.
    ///
    /// Returns `Some(Up)` only on the DOWN → UP edge.
    pub fn on_keepalive(&mut self, now_ms: u64) -> Option<PeerState> {
        self.stats.consecutive_misses = 0;
        if self.alive {
            return None;
        }

        self.alive = true;
        self.stats.last_change_up = Some(now_ms);
        Some(PeerState::Up)
    }

    /// A receive timed out, failed, or carried an undecodable payload.
    ///
    /// Returns `Some(Down)` when the miss pushes the consecutive count to the
    /// threshold while UP.
    pub fn on_receive_failure(&mut self, now_ms: u64) -> Option<PeerState> {
        self.stats.total_misses += 1;
        if !self.alive {
            return None;
        }

        self.stats.consecutive_misses += 1;
        if self.stats.consecutive_misses >= self.threshold {
            return self.go_down(now_ms);
        }
        None
    }

    /// Sending a keepalive failed. Takes an UP peer down immediately.
    pub fn on_transmit_failure(&mut self, now_ms: u64) -> Option<PeerState> {
        self.stats.total_misses += 1;
        if !self.alive {
            return None;
        }
        self.go_down(now_ms)
    }

    fn go_down(&mut self, now_ms: u64) -> Option<PeerState> {
        self.alive = false;
        self.stats.last_change_down = Some(now_ms);
        Some(PeerState::Down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Interval 1000ms, dead interval 3000ms.
    fn up_tracker() -> Liveness {
        let mut liveness = Liveness::new(Liveness::threshold_for(1000, 3000));
        assert_eq!(liveness.on_keepalive(1_000), Some(PeerState::Up));
        liveness
    }

    // ==================== Threshold ====================

    #[test]
    fn test_threshold_is_floor_of_ratio() {
        assert_eq!(Liveness::threshold_for(1000, 3000), 3);
        assert_eq!(Liveness::threshold_for(1000, 3999), 3);
        assert_eq!(Liveness::threshold_for(300, 1000), 3);
        assert_eq!(Liveness::threshold_for(1000, 500), 0);
    }

    #[test]
    fn test_threshold_zero_interval() {
        assert_eq!(Liveness::threshold_for(0, 3000), 0);
    }

    // ==================== DOWN → UP ====================

    #[test]
    fn test_starts_down() {
        let liveness = Liveness::new(3);
        assert!(!liveness.is_alive());
        assert_eq!(liveness.state(), PeerState::Down);
        assert_eq!(liveness.stats(), KeepaliveStats::default());
    }

    #[test]
    fn test_first_keepalive_goes_up() {
        let mut liveness = Liveness::new(3);

        assert_eq!(liveness.on_keepalive(5_000), Some(PeerState::Up));
        assert!(liveness.is_alive());
        assert_eq!(liveness.stats().last_change_up, Some(5_000));
        assert_eq!(liveness.stats().last_change_down, None);
    }

    #[test]
    fn test_repeated_keepalives_emit_once() {
        let mut liveness = up_tracker();

        for i in 0..10 {
            assert_eq!(liveness.on_keepalive(2_000 + i), None);
        }
        assert!(liveness.is_alive());
        assert_eq!(liveness.stats().last_change_up, Some(1_000));
    }

    // ==================== UP → DOWN via receive misses ====================

    #[test]
    fn test_third_miss_goes_down_not_second() {
        let mut liveness = up_tracker();

        assert_eq!(liveness.on_receive_failure(2_000), None);
        assert_eq!(liveness.on_receive_failure(3_000), None);
        assert!(liveness.is_alive());
        assert_eq!(liveness.stats().consecutive_misses, 2);

        assert_eq!(liveness.on_receive_failure(4_000), Some(PeerState::Down));
        assert!(!liveness.is_alive());
        assert_eq!(liveness.stats().last_change_down, Some(4_000));
    }

    #[test]
    fn test_keepalive_resets_consecutive_misses() {
        let mut liveness = up_tracker();

        liveness.on_receive_failure(2_000);
        liveness.on_receive_failure(3_000);
        assert_eq!(liveness.on_keepalive(3_500), None);
        assert_eq!(liveness.stats().consecutive_misses, 0);

        // Two more misses are not enough after the reset
        assert_eq!(liveness.on_receive_failure(4_000), None);
        assert_eq!(liveness.on_receive_failure(5_000), None);
        assert!(liveness.is_alive());
        assert_eq!(liveness.stats().total_misses, 4);
    }

    #[test]
    fn test_zero_threshold_goes_down_on_first_miss() {
        let mut liveness = Liveness::new(0);
        liveness.on_keepalive(0);

        assert_eq!(liveness.on_receive_failure(1), Some(PeerState::Down));
    }

    // ==================== UP → DOWN via transmit failure ====================

    #[test]
    fn test_transmit_failure_goes_down_immediately() {
        let mut liveness = up_tracker();

        assert_eq!(liveness.on_transmit_failure(1_500), Some(PeerState::Down));
        assert!(!liveness.is_alive());
        assert_eq!(liveness.stats().last_change_down, Some(1_500));
        assert_eq!(liveness.stats().total_misses, 1);
    }

    // ==================== DOWN → DOWN ====================

    #[test]
    fn test_failures_while_down_only_count() {
        let mut liveness = up_tracker();
        liveness.on_transmit_failure(1_500);

        for i in 0..5 {
            assert_eq!(liveness.on_receive_failure(2_000 + i), None);
            assert_eq!(liveness.on_transmit_failure(2_000 + i), None);
        }

        assert_eq!(liveness.stats().total_misses, 11);
        assert_eq!(liveness.stats().last_change_down, Some(1_500));
    }

    #[test]
    fn test_failures_before_first_keepalive_emit_nothing() {
        let mut liveness = Liveness::new(3);

        for i in 0..10 {
            assert_eq!(liveness.on_receive_failure(i), None);
        }
        assert_eq!(liveness.stats().total_misses, 10);
        assert_eq!(liveness.stats().consecutive_misses, 0);
        assert_eq!(liveness.stats().last_change_down, None);
    }

    // ==================== Recovery ====================

    #[test]
    fn test_recovers_after_down() {
        let mut liveness = up_tracker();
        for t in [2_000, 3_000, 4_000] {
            liveness.on_receive_failure(t);
        }
        assert!(!liveness.is_alive());

        assert_eq!(liveness.on_keepalive(9_000), Some(PeerState::Up));
        let stats = liveness.stats();
        assert_eq!(stats.last_change_up, Some(9_000));
        assert_eq!(stats.last_change_down, Some(4_000));
        assert_eq!(stats.consecutive_misses, 0);
    }
}
