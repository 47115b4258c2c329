use std::time::Duration;

use crate::error::FetchError;

/// How long to wait before re-fetching a page that failed at the transport
/// level, and when to give up.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay after an HTTP 429.
    pub rate_limit_delay: Duration,
    /// Base delay after any other transport failure.
    pub transport_delay: Duration,
    /// Growth factor per consecutive failure on the same page.
    pub multiplier: f64,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_delay: Duration::from_secs(5),
            transport_delay: Duration::from_secs(3),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, forever.
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            rate_limit_delay: Duration::ZERO,
            transport_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Delay before the next try, given `failures` consecutive failures so far
    /// (1 after the first), or `None` once the attempt budget is spent.
    pub fn next_delay(&self, err: &FetchError, failures: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| failures >= max) {
            return None;
        }

        let base = if err.is_rate_limited() {
            self.rate_limit_delay
        } else {
            self.transport_delay
        };
        let exp = failures.saturating_sub(1).min(32) as i32;
        let scaled = base.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let mut delay = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        if let FetchError::Transport {
            retry_after: Some(hint),
            ..
        } = err
        {
            delay = delay.max(*hint).min(self.max_delay);
        }
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limited() -> FetchError {
        FetchError::transport(Some(429), "Too Many Requests")
    }

    #[test]
    fn rate_limit_waits_longer() {
        let policy = RetryPolicy::default();
        let rl = policy.next_delay(&rate_limited(), 1).unwrap();
        let other = policy
            .next_delay(&FetchError::transport(Some(503), "unavailable"), 1)
            .unwrap();
        assert_eq!(rl, Duration::from_secs(5));
        assert_eq!(other, Duration::from_secs(3));
        assert!(rl > other);
    }

    #[test]
    fn timeout_uses_transport_delay() {
        let policy = RetryPolicy::default();
        let d = policy.next_delay(&FetchError::transport(None, "timed out"), 1);
        assert_eq!(d, Some(Duration::from_secs(3)));
    }

    #[test]
    fn exponential_and_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = (1..=5)
            .map(|n| policy.next_delay(&rate_limited(), n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);

        assert_eq!(
            policy.next_delay(&rate_limited(), 1_000),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn retry_after_hint_raises_delay() {
        let policy = RetryPolicy::default();
        let err = FetchError::Transport {
            status: Some(429),
            retry_after: Some(Duration::from_secs(42)),
            message: "Too Many Requests".into(),
        };
        assert_eq!(policy.next_delay(&err, 1), Some(Duration::from_secs(42)));

        let err = FetchError::Transport {
            status: Some(429),
            retry_after: Some(Duration::from_secs(600)),
            message: "Too Many Requests".into(),
        };
        assert_eq!(policy.next_delay(&err, 1), Some(Duration::from_secs(60)));
    }

    #[test]
    fn bounded_attempts() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::immediate()
        };
        assert!(policy.next_delay(&rate_limited(), 1).is_some());
        assert!(policy.next_delay(&rate_limited(), 2).is_some());
        assert!(policy.next_delay(&rate_limited(), 3).is_none());
    }

    #[test]
    fn unbounded_by_default() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.next_delay(&rate_limited(), u32::MAX), Some(Duration::ZERO));
    }
}
