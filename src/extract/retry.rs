use rand::Rng;
use std::time::Duration;

use crate::config::HttpConfig;

/// Delay schedule between attempts of one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`, plus up to one second of jitter.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let scale = 2f64.powi(attempt.min(16) as i32);
                let capped = (base.as_secs_f64() * scale).min(max.as_secs_f64());
                let mut delay = Duration::from_secs_f64(capped);
                if jitter {
                    delay += jitter_fraction();
                }
                delay.min(max)
            }
        }
    }
}

// Uniform in [0, 1s).
fn jitter_fraction() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..1_000))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on_status: Vec<u16>,
    /// Upper bound honored for a server-supplied `Retry-After`.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(http: &HttpConfig) -> Self {
        Self {
            max_retries: http.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(http.backoff_base_ms),
                max: Duration::from_millis(http.backoff_max_ms),
                jitter: true,
            },
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
            max_retry_after: Duration::from_secs(120),
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// Delay before retry number `attempt` (0-based). A server hint wins when present.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_retry_after),
            None => self.backoff.delay(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(350));
        assert_eq!(backoff.delay(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_one_second_and_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: true,
        };
        let delays: Vec<Duration> = (0..50).map(|_| backoff.delay(0)).collect();
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(100));
            assert!(*delay < Duration::from_millis(1_100));
        }
        // back-to-back calls are not all identical
        let distinct: std::collections::HashSet<_> = delays.iter().collect();
        assert!(distinct.len() > 1);

        let capped = Backoff::Exponential {
            base: Duration::from_secs(10),
            max: Duration::from_secs(2),
            jitter: true,
        };
        assert_eq!(capped.delay(3), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 3);
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(10));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(3600))),
            policy.max_retry_after
        );
    }

    #[test]
    fn test_status_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry_status(429));
        assert!(policy.should_retry_status(503));
        assert!(!policy.should_retry_status(404));
        assert!(!policy.should_retry_status(401));
    }
}
