//! Wall-clock budget for a single iteration.
//!
//! Time is always passed in so the caller's clock decides what "now" is.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RuntimeBudget {
    limit: Duration,
    started: Instant,
}

impl RuntimeBudget {
    pub fn start_at(limit: Duration, started: Instant) -> Self {
        Self { limit, started }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn is_exceeded_at(&self, now: Instant) -> bool {
        self.elapsed_at(now) >= self.limit
    }

    /// Remaining time, zero once exceeded.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.limit.saturating_sub(self.elapsed_at(now))
    }

    /// Restart the clock with the full limit.
    pub fn reset_at(&mut self, now: Instant) {
        self.started = now;
    }
}
