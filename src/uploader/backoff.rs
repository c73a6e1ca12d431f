use std::time::Duration;

use rand::{thread_rng, Rng};

/// Exponential backoff with jitter for provider throttling:
/// `base * 2^attempt + random(0..=jitter_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub jitter_max: Duration,
    /// Throttled attempts that are retried. The attempt after the last retry
    /// surfaces `RateLimitExceeded` instead of waiting again.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            jitter_max: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            thread_rng().gen_range(0..=jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    pub fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).saturating_add(jitter)
    }

    /// `attempt` is zero based; true once every retry has been spent.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            jitter_max: Duration::ZERO,
            max_retries: 3,
        };
        let delays: Vec<_> = (0..3).map(|a| policy.delay(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1_000),
                Duration::from_millis(2_000)
            ]
        );
    }

    #[test]
    fn jitter_stays_in_bounds_and_keeps_growth() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1_000),
            jitter_max: Duration::from_millis(1_000),
            max_retries: 3,
        };
        for _ in 0..50 {
            let first = policy.delay(0);
            let second = policy.delay(1);
            let third = policy.delay(2);
            assert!(first >= Duration::from_millis(1_000) && first <= Duration::from_millis(2_000));
            assert!(third >= Duration::from_millis(4_000) && third <= Duration::from_millis(5_000));
            assert!(first <= second && second <= third);
        }
    }

    #[test]
    fn exhausted_after_max_retries() {
        let policy = BackoffPolicy::default();
        assert!(!policy.exhausted(0));
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }
}
