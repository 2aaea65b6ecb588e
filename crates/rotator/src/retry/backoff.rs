//! Delay between attempts.

use std::time::Duration;

use rand::Rng;

use super::{BackoffStrategy, RetryPolicy};

/// Bounds of the jitter factor.
pub const JITTER_MIN: f64 = 0.5;
pub const JITTER_MAX: f64 = 1.5;

impl RetryPolicy {
    /// Delay after the `retry_number`-th failed attempt (1-based), before
    /// jitter.
    ///
    /// - `Fixed`: `base_delay`
    /// - `Linear`: `base_delay * n`
    /// - `Exponential`: `min(base_delay * multiplier^(n-1), max_delay)`
    pub fn base_delay_for(&self, retry_number: u32) -> Duration {
        let n = retry_number.max(1);
        match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.powi(n as i32 - 1);
                let secs = self.base_delay.as_secs_f64() * factor;
                let max = self.max_delay.as_secs_f64();
                if !secs.is_finite() || secs >= max {
                    self.max_delay
                } else if secs <= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    /// Delay after the `retry_number`-th failed attempt, jittered when the
    /// policy asks for it.
    pub fn delay(&self, retry_number: u32) -> Duration {
        let delay = self.base_delay_for(retry_number);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// Delay to wait before starting `attempt` (1-based). Zero for the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.delay(attempt - 1)
        }
    }
}

/// Multiply `delay` by a uniform factor in `[0.5, 1.5]`.
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_pre_attempt_delays() {
        let policy = exponential();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(1));
        assert_eq!(policy.delay_before(3), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..exponential()
        };
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(60), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = RetryPolicy {
            backoff: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(200),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(linear.delay(1), Duration::from_millis(200));
        assert_eq!(linear.delay(3), Duration::from_millis(600));

        let fixed = RetryPolicy {
            backoff: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(300),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(fixed.delay(1), fixed.delay(7));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..exponential()
        };
        for _ in 0..1000 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_secs(1), "{delay:?}");
            assert!(delay <= Duration::from_secs(3), "{delay:?}");
        }
    }
}
