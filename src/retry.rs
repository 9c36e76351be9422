//! Retry policy for transient transport failures.
//!
//! Dispatch retries connection-level failures (connect timeout, refused,
//! transport drop before handshake) with exponential backoff and bounded
//! jitter. Module-reported failures and module timeouts are never retried;
//! that classification lives with the error types, not here.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy: attempt count plus backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3).
    pub max_attempts: u32,
    /// Delay before the second attempt (default 1s).
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt (default 2.0).
    pub factor: f64,
    /// Jitter as a fraction of the computed delay (default 0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Compute the backoff delay after the given failed attempt (1-indexed),
    /// with jitter applied.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let delay = base * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jittered = if self.jitter > 0.0 {
            let spread = delay * self.jitter;
            delay + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            delay
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_after(1).as_millis();
            assert!((800..=1200).contains(&d), "delay {d}ms outside ±20%");
        }
    }

    #[test]
    fn test_none_never_retries() {
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
