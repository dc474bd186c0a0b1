//! Retry policies for transient browser failures.
//!
//! Retry behavior is an explicit value passed per call site instead of a
//! loop buried inside the browser methods.

use std::time::Duration;

/// A bounded retry schedule: attempt count, base delay and optional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay between attempts
    pub base_delay: Duration,
    /// Jitter fraction in `0.0..=1.0` applied on top of the base delay
    pub jitter: f64,
}

impl RetryPolicy {
    /// Create a policy with no jitter
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter: 0.0,
        }
    }

    /// A single attempt, no delay
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// The stale-element schedule: 10 attempts at 100ms intervals
    #[must_use]
    pub const fn stale() -> Self {
        Self::new(10, Duration::from_millis(100))
    }

    /// Set the jitter fraction
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given retry attempt (1-based). Jitter is derived
    /// from the attempt number so schedules stay reproducible.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.jitter <= 0.0 {
            return self.base_delay;
        }
        let phase = f64::from(attempt % 7) / 7.0;
        let factor = 1.0 + self.jitter * phase;
        self.base_delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::stale()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_schedule() {
        let policy = RetryPolicy::stale();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_no_jitter_is_constant() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        assert_eq!(policy.delay_for(1), policy.delay_for(2));
    }

    #[test]
    fn test_jitter_is_bounded_and_reproducible() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).with_jitter(0.5);
        for attempt in 1..=20 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
            assert_eq!(delay, policy.delay_for(attempt));
        }
    }

    #[test]
    fn test_none_policy() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }
}
