use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub max_active: usize,
}

impl Scheduler {
    pub fn new(max_active: usize) -> Self {
        Self { max_active }
    }

    pub fn can_start(&self, active_count: usize) -> bool {
        active_count < self.max_active
    }
}

/// Exponential backoff with symmetric jitter for transient transfer failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub validation_retries: u32,
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            validation_retries: config.validation_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_base_ms)),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_ratio == 0.0 || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        nominal.mul_f64(1.0 + spread).min(self.max)
    }

    fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy::from_config(&QueueConfig {
            max_workers: 1,
            max_attempts: 4,
            validation_retries: 1,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_ratio,
        })
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = policy(0.0);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let policy = policy(0.5);
        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn attempt_cap() {
        let policy = policy(0.0);
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
        assert!(Scheduler::new(2).can_start(1));
        assert!(!Scheduler::new(2).can_start(2));
    }
}
