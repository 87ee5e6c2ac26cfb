//! Reconnect backoff policy.
//!
//! `delay(n) = min(base * factor^n, max)`. No jitter: the same attempt
//! always yields the same delay.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    factor: u32,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self { base, factor, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (0-based). Saturates at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.factor
            .checked_pow(attempt)
            .and_then(|scale| self.base.checked_mul(scale))
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(secs(1), 2, secs(30));
        let delays: Vec<u64> = (0..9).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30]);
    }

    #[test]
    fn huge_attempt_saturates() {
        let backoff = Backoff::new(secs(4), 2, secs(86_400));
        assert_eq!(backoff.delay(u32::MAX), secs(86_400));
        assert_eq!(backoff.delay(64), secs(86_400));
    }

    #[test]
    fn factor_one_is_constant() {
        let backoff = Backoff::new(Duration::from_millis(250), 1, secs(10));
        assert_eq!(backoff.delay(0), backoff.delay(100));
    }

    #[test]
    fn base_above_max_is_clamped() {
        let backoff = Backoff::new(secs(60), 2, secs(10));
        assert_eq!(backoff.delay(0), secs(10));
    }
}
