//! Reconnect backoff: exponential with jitter, reset on a successful
//! connection.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff (factor 2) with up to 25% additive jitter and a cap.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, current: base }
    }

    /// Returns the delay to wait before the next scan-and-connect cycle and
    /// advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_cap = (self.current.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap));
        let delay = self.current + jitter;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Drops back to the base delay. Called on every confirmed connect.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// The undelayed value the next cycle would start from.
    pub fn current(&self) -> Duration {
        self.current
    }
}
