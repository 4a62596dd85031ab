//! Per-worker exponential backoff (spec.md §4.1 "Failure policy").
//!
//! Grounded in `ferrex-core::auth::rate_limit::backoff::exponential`; unlike
//! that helper (which is a pure function of a violation count, used for
//! rate-limit cooldowns that reset are driven externally), each sync worker
//! owns one stateful `Backoff` across its own loop iterations so a plain
//! `.fail()` / `.reset()` pair is all a worker needs to call.

use std::time::Duration;

const DEFAULT_BASE: Duration = Duration::from_secs(1);
const DEFAULT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
            failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before retrying.
    /// Doubles on every call, capped at `max`.
    pub fn fail(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Reset to the base delay after a successful cycle.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.fail(), Duration::from_secs(1));
        assert_eq!(backoff.fail(), Duration::from_secs(2));
        assert_eq!(backoff.fail(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.fail();
        }
        assert_eq!(backoff.fail(), Duration::from_secs(60));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.fail();
        backoff.fail();
        backoff.reset();
        assert_eq!(backoff.fail(), Duration::from_secs(1));
        assert_eq!(backoff.failures(), 1);
    }
}
