//! Retry backoff policy.
//!
//! Bounded exponential backoff for retryable provider failures. The policy
//! only computes delays; the attempt loop lives with the aggregator so each
//! attempt can re-acquire rate-limiter budget and restart the stream.

use std::time::Duration;

use rand::Rng;

use crate::config::AggregatorConfig;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Always at least 1.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Ceiling for any single delay.
    pub max: Duration,
}

impl RetryPolicy {
    /// Policy from the aggregator section of the config.
    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let ms = self.base.as_millis() as f64 * 2f64.powi(exponent);
        Duration::from_millis(ms as u64).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AggregatorConfig::default())
    }
}

/// Add up to 25% random jitter so parallel retries spread out.
pub fn with_jitter(duration: Duration) -> Duration {
    let quarter = duration.as_millis() as u64 / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter)
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let policy = RetryPolicy {
            attempts: 10,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        };

        assert_eq!(policy.delay_for(5), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(10_000));
    }

    #[test]
    fn test_from_config_uses_aggregator_defaults() {
        let policy = RetryPolicy::from_config(&AggregatorConfig::default());
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.base, Duration::from_millis(1000));
        assert_eq!(policy.max, Duration::from_millis(10_000));
    }

    #[test]
    fn test_from_config_clamps_zero_attempts() {
        let mut config = AggregatorConfig::default();
        config.retry_attempts = 0;
        assert_eq!(RetryPolicy::from_config(&config).attempts, 1);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_secs(1);
        for _ in 0..50 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered < base + Duration::from_millis(250));
        }
    }

    #[test]
    fn test_jitter_passes_tiny_durations_through() {
        let tiny = Duration::from_millis(3);
        assert_eq!(with_jitter(tiny), tiny);
    }
}
