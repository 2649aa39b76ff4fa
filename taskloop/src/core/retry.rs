//! Retry bookkeeping for connection and loop failures.
//!
//! Both policies only count and compute delays; sleeping and re-invoking is
//! the caller's job.

use std::time::Duration;

/// Bounded exponential backoff for transport failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRetry {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
    attempts: u32,
    current_delay: Duration,
}

impl ConnectionRetry {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: multiplier.max(1),
            attempts: 0,
            current_delay: base_delay,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = self.current_delay;
        self.current_delay = self.current_delay.saturating_mul(self.multiplier);
        Some(delay)
    }

    /// Forget previous failures after a successful call.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.base_delay;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Bounded fixed-delay retry for loop/step-limit failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRetry {
    max_attempts: u32,
    delay: Duration,
    attempts: u32,
}

impl LoopRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
