//! Idle-timeout bookkeeping for `KEEP_ALIVE` packets (spec §4.6).
//!
//! The client sends a `KEEP_ALIVE` after 5s of local idle and expects one
//! back within the same interval, or it invalidates its socket and enters
//! reconnect. The server applies a longer, unilateral 11s idle timeout
//! before tearing the session down itself.

use std::time::{Duration, Instant};

/// Client-side idle interval: send (and expect an echo) every 5s.
pub const CLIENT_IDLE_INTERVAL: Duration = Duration::from_secs(5);
/// Server-side unilateral teardown timeout.
pub const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(11);

/// Tracks the last time *any* traffic (not just keep-alives) was seen on a
/// session, so callers can decide when to send a probe or give up.
pub struct IdleTracker {
    last_activity: Instant,
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTracker {
    pub fn new() -> Self {
        Self { last_activity: Instant::now() }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn client_should_probe(&self) -> bool {
        self.idle_for() >= CLIENT_IDLE_INTERVAL
    }

    pub fn server_should_give_up(&self) -> bool {
        self.idle_for() >= SERVER_IDLE_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_does_not_trigger_anything() {
        let tracker = IdleTracker::new();
        assert!(!tracker.client_should_probe());
        assert!(!tracker.server_should_give_up());
    }

    #[test]
    fn touch_resets_the_clock() {
        let mut tracker = IdleTracker::new();
        std::thread::sleep(Duration::from_millis(5));
        tracker.touch();
        assert!(tracker.idle_for() < CLIENT_IDLE_INTERVAL);
    }
}
