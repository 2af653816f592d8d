//! Exponential backoff with jitter.

use std::time::Duration;

/// Reconnect delay policy: `base × 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter: bool) -> Self {
        Self { base_ms, max_ms, jitter }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential_base = 2u64.saturating_pow(attempt);
        let delay_ms = self.base_ms.saturating_mul(exponential_base);
        let capped_delay = delay_ms.min(self.max_ms);

        // Apply jitter (0 to 10% of the delay)
        let jitter_range = capped_delay / 10;
        let jitter = if self.jitter && jitter_range > 0 {
            fastrand::u64(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let backoff = Backoff::new(100, 2000, true);
        let b0 = backoff.delay(0);
        assert!(b0.as_millis() >= 100 && b0.as_millis() < 110);

        let b1 = backoff.delay(1);
        assert!(b1.as_millis() >= 200);

        let max = backoff.delay(10);
        assert!(max.as_millis() >= 2000 && max.as_millis() < 2200);
    }

    #[test]
    fn test_exact_without_jitter() {
        let backoff = Backoff::new(1000, 30_000, false);
        assert_eq!(backoff.delay(0), Duration::from_millis(1000));
        assert_eq!(backoff.delay(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff.delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff.delay(63), Duration::from_millis(30_000));
    }
}
