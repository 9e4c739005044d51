//! Retry policy for message delivery.

use crate::gateway::{Error, TransportError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Randomize each delay between half and all of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 8000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nominal = (self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent))
            .min(self.max_delay_ms as f64) as u64;

        let millis = if self.jitter && nominal > 1 {
            rand::rng().random_range(nominal / 2..=nominal)
        } else {
            nominal
        };
        Duration::from_millis(millis)
    }
}

/// Classify a delivery error, returning the category if retryable.
///
/// Returns `Some(category)` for transient failures worth another attempt,
/// `None` for errors that would fail the same way again.
pub(crate) fn retryable_category(err: &Error) -> Option<&'static str> {
    match err {
        Error::Network(TransportError::Timeout) => Some("Request timed out"),
        Error::Network(_) => Some("Network error"),
        Error::Server(_) => Some("Server error"),
        Error::Validation(api) if api.status == 429 => Some("Rate limited"),
        Error::Validation(api) if api.status == 408 => Some("Request timed out"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 3000,
            jitter: false,
        };
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2).as_millis();
            assert!((500..=1000).contains(&delay));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!RetryPolicy::none().allows_another(1));
    }

    #[test]
    fn test_retryable_classification() {
        assert_eq!(
            retryable_category(&Error::Network(TransportError::Timeout)),
            Some("Request timed out")
        );
        assert_eq!(
            retryable_category(&Error::Network(TransportError::Connect("refused".into()))),
            Some("Network error")
        );
        assert_eq!(
            retryable_category(&Error::from_status(503, "")),
            Some("Server error")
        );
        assert_eq!(
            retryable_category(&Error::from_status(429, "slow down")),
            Some("Rate limited")
        );
    }

    #[test]
    fn test_non_retryable() {
        assert_eq!(retryable_category(&Error::from_status(400, "bad")), None);
        assert_eq!(retryable_category(&Error::from_status(401, "nope")), None);
        assert_eq!(retryable_category(&Error::SessionExpired), None);
        assert_eq!(retryable_category(&Error::Cancelled), None);
    }

    #[test]
    fn test_deserialize_partial() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 500);
    }
}
