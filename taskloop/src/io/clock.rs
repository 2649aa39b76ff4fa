//! Time source for budgets, retry delays and timestamps.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Monotonic clock plus interruptible sleep. Tests substitute a manual clock.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Sleep for `duration`; returns `false` if `cancel` fired first.
    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }
}

/// Current UTC time as RFC 3339 with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Run identifier, `run-YYYYmmdd-HHMMSS` in UTC.
pub fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_shape() {
        let id = new_run_id();
        assert!(id.starts_with("run-"));
        assert_eq!(id.len(), "run-20260101-000000".len());
        assert_eq!(&id[12..13], "-");
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!SystemClock.sleep(Duration::from_secs(30), Some(&token)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_completes_without_cancel() {
        assert!(SystemClock.sleep(Duration::from_millis(5), None));
    }

    #[test]
    fn timestamps_are_utc() {
        assert!(now_rfc3339().ends_with('Z'));
    }
}
