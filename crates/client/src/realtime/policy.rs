use std::time::Duration;

/// How the delay grows between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    Fixed,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Bounded reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after a drop before giving up (0 = never reconnect).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Whether attempt number `attempt` (1-indexed) may still run.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_schedule_doubles_then_caps() {
        let policy = ReconnectPolicy::exponential(10, Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (1..=6).map(|n| policy.delay_for_attempt(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn fixed_schedule_never_grows() {
        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), policy.delay_for_attempt(3));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_capped(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            attempt in 1u32..200,
        ) {
            let policy = ReconnectPolicy::exponential(
                u32::MAX,
                Duration::from_millis(base),
                Duration::from_millis(base + extra),
            );
            let this = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= policy.max_delay);
            prop_assert!(this >= policy.base_delay.min(policy.max_delay));
        }
    }
}
