//! Global token-bucket rate limiter
//!
//! One bucket is shared by every request on the server. Tokens refill
//! continuously at `limit / window`, up to `limit`.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of an admission check, with the values reported in the
/// `X-Ratelimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until at least one token is available again
    pub reset_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    /// Tokens added per second
    refill_rate: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    /// `limit <= 0` (or a zero window) disables limiting
    pub fn new(limit: i64, window: Duration) -> Self {
        if limit <= 0 || window.is_zero() {
            return Self::disabled();
        }

        let limit = limit as u64;
        Self {
            limit,
            refill_rate: limit as f64 / window.as_secs_f64(),
            bucket: Some(Mutex::new(Bucket {
                tokens: limit as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self {
            limit: 0,
            refill_rate: 0.0,
            bucket: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Take one token. Returns `None` when limiting is disabled.
    pub fn admit(&self) -> Option<RateDecision> {
        let bucket = self.bucket.as_ref()?;
        let mut bucket = bucket.lock();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.limit as f64);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let reset_after = if bucket.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_rate)
        };

        Some(RateDecision {
            allowed,
            limit: self.limit,
            remaining: bucket.tokens.floor() as u64,
            reset_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_exactly_capacity_admitted() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));

        for i in 0..5 {
            let decision = limiter.admit().unwrap();
            assert!(decision.allowed, "request {} should be admitted", i);
            assert_eq!(decision.remaining, 4 - i);
            assert_eq!(decision.limit, 5);
        }

        let rejected = limiter.admit().unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        let reset_ms = rejected.reset_after.as_millis();
        assert!((11_999..=12_001).contains(&reset_ms), "reset after {}ms", reset_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_resumes_admission() {
        let limiter = RateLimiter::new(2, Duration::from_secs(2));
        assert!(limiter.admit().unwrap().allowed);
        assert!(limiter.admit().unwrap().allowed);
        assert!(!limiter.admit().unwrap().allowed);

        // One token per second
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit().unwrap().allowed);
        assert!(!limiter.admit().unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let limiter = RateLimiter::new(3, Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(3600)).await;

        let admitted = (0..10).filter(|_| limiter.admit().unwrap().allowed).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_non_positive_limit_disables() {
        for limit in [0, -1] {
            let limiter = RateLimiter::new(limit, Duration::from_secs(60));
            assert!(!limiter.is_enabled());
            assert_eq!(limiter.admit(), None);
        }
    }
}
