//! Newline-rate limiter for the PTY→client path (spec §4.6).
//!
//! A crude backpressure mechanism only: it never reorders or drops packets,
//! it just stops the session loop from polling the PTY fd once a wall-clock
//! second's newline budget is exhausted. The cap is enforced by pausing the
//! *next read* of the PTY fd, not by discarding bytes already read — bytes
//! over budget stay in the kernel's tty buffer until the next window opens,
//! mirroring the original's `outputPerSecond < 1024` gate on
//! `read(masterFd, ...)` itself.

use std::time::{Duration, Instant};

const LINES_PER_SECOND_CAP: u32 = 1024;
const WINDOW: Duration = Duration::from_secs(1);

/// Tracks newlines emitted in the current wall-clock second.
pub struct NewlineRateLimiter {
    window_start: Instant,
    lines_this_window: u32,
}

impl Default for NewlineRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl NewlineRateLimiter {
    pub fn new() -> Self {
        Self { window_start: Instant::now(), lines_this_window: 0 }
    }

    fn roll_window_if_elapsed(&mut self) {
        if self.window_start.elapsed() >= WINDOW {
            self.window_start = Instant::now();
            self.lines_this_window = 0;
        }
    }

    /// Whether the caller may read the PTY fd again this window. Rolls the
    /// window over first, so a stale cap from a prior second never blocks a
    /// fresh one. Call this *before* reading, not after.
    pub fn should_read(&mut self) -> bool {
        self.roll_window_if_elapsed();
        self.lines_this_window <= LINES_PER_SECOND_CAP
    }

    /// Record `chunk`'s newlines against the current window. Call only after
    /// a read that a preceding `should_read` already cleared.
    pub fn record(&mut self, chunk: &[u8]) {
        self.lines_this_window += chunk.iter().filter(|&&b| b == b'\n').count() as u32;
    }

    /// How long the caller should sleep before `should_read` can pass again.
    pub fn time_until_next_window(&self) -> Duration {
        WINDOW.saturating_sub(self.window_start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_cap_within_one_window() {
        let mut limiter = NewlineRateLimiter::new();
        assert!(limiter.should_read());
        limiter.record(&vec![b'\n'; 2000]);
        assert!(!limiter.should_read());
    }

    #[test]
    fn allows_traffic_under_the_cap() {
        let mut limiter = NewlineRateLimiter::new();
        assert!(limiter.should_read());
        limiter.record(&vec![b'\n'; 10]);
        assert!(limiter.should_read());
    }

    #[test]
    fn window_resets_after_it_elapses() {
        let mut limiter = NewlineRateLimiter::new();
        limiter.record(&vec![b'\n'; 2000]);
        assert!(!limiter.should_read());
        limiter.window_start -= Duration::from_millis(1100);
        assert!(limiter.should_read());
    }
}
