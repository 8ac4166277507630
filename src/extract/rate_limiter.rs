use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Request budget for one source.
#[derive(Clone, Debug)]
pub struct Limits {
    pub requests_per_min: u32,
    /// Tokens available up front. 1 paces every request evenly.
    pub burst: u32,
}

impl Limits {
    pub fn per_minute(requests_per_min: u32) -> Self {
        Self {
            requests_per_min,
            burst: 1,
        }
    }
}

/// Token bucket shared by every request an extractor makes.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    limits: Limits,
    // token bucket modeled by the current tokens and the time of last refill
    tokens: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        let capacity = limits.burst.max(1) as f64;
        Self {
            inner: Arc::new(Inner {
                limits,
                tokens: Mutex::new((capacity, Instant::now())),
            }),
        }
    }

    pub fn requests_per_min(&self) -> u32 {
        self.inner.limits.requests_per_min
    }

    /// Wait until a request may be sent. A zero budget means unlimited.
    pub async fn acquire(&self) {
        let rpm = self.inner.limits.requests_per_min;
        if rpm == 0 {
            return;
        }
        let capacity = self.inner.limits.burst.max(1) as f64;
        let refill_rate = rpm as f64 / 60.0; // tokens per second

        loop {
            let mut guard = self.inner.tokens.lock().await;
            let (ref mut tokens, ref mut last) = *guard;
            let now = Instant::now();
            let elapsed = now.duration_since(*last).as_secs_f64();
            *tokens = (*tokens + elapsed * refill_rate).min(capacity);
            *last = now;
            if *tokens >= 1.0 {
                *tokens -= 1.0;
                return;
            }
            let secs = (1.0 - *tokens) / refill_rate;
            drop(guard);
            tokio::time::sleep(Duration::from_secs_f64(secs.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paces_requests_to_budget() {
        let limiter = RateLimiter::new(Limits::per_minute(60));
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // first token is immediate, the next two wait ~1s each
        assert!(start.elapsed() >= Duration::from_millis(1_900));
    }

    #[tokio::test]
    async fn test_zero_budget_is_unlimited() {
        let limiter = RateLimiter::new(Limits::per_minute(0));
        for _ in 0..100 {
            limiter.acquire().await;
        }
    }
}
