use std::time::Duration;

/// Backoff schedule for remote requests: delays double from `base_delay` up
/// to `max_delay`, and the whole request (attempts plus sleeps) must fit
/// inside `deadline`. Once the deadline is spent, the last error wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            deadline: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// The sleep before attempt `n + 2` (there is no sleep before the first
    /// attempt). Exponential, capped at `max_delay`.
    pub fn delay_for(&self, completed_attempts: u32) -> Duration {
        let shift = completed_attempts.min(16);
        let factor = 1u64 << shift;
        self.base_delay
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            deadline: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), policy.max_delay);
    }
}
