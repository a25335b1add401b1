//! Deterministic retry backoff for downstream calls.

use std::time::Duration;

/// Exponential backoff for repeated call attempts. Attempt 0 is the initial
/// try and waits nothing; each retry then waits twice as long as the one
/// before, starting at `base` and clamped to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub base: Duration,
    pub cap: Duration,
}

impl RetrySchedule {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let mut delay = self.base;
        for _ in 1..attempt {
            if delay >= self.cap {
                return self.cap;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_attempt_waits_nothing() {
        let schedule = RetrySchedule::new(Duration::from_millis(250), Duration::from_secs(10));
        assert_eq!(schedule.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_each_retry_doubles() {
        let schedule = RetrySchedule::new(Duration::from_millis(250), Duration::from_secs(10));
        assert_eq!(schedule.delay(1), Duration::from_millis(250));
        assert_eq!(schedule.delay(2), Duration::from_millis(500));
        assert_eq!(schedule.delay(4), Duration::from_secs(2));
    }

    #[test]
    fn test_cap_is_a_ceiling() {
        let schedule = RetrySchedule::new(Duration::from_secs(1), Duration::from_secs(3));
        // 1s, 2s, then the 4s step clamps.
        assert_eq!(schedule.delay(2), Duration::from_secs(2));
        assert_eq!(schedule.delay(3), Duration::from_secs(3));
        assert_eq!(schedule.delay(20), Duration::from_secs(3));
        assert_eq!(schedule.delay(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_cap_below_base_still_clamps() {
        let schedule = RetrySchedule::new(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(schedule.delay(1), Duration::from_secs(2));
        assert_eq!(schedule.delay(7), Duration::from_secs(2));
    }
}
