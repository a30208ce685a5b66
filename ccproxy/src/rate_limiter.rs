//! Per-key token bucket rate limiter.
//!
//! The teacher's own `plugins::rate_limiting` is a fixed-window counter and
//! is marked deprecated in its doc comment; this is a fresh token-bucket
//! implementation, keyed the same way (`DashMap<String, _>`) but refilling
//! continuously instead of resetting on a wall-clock boundary.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

impl Bucket {
    fn new(burst: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_touched: now,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate_per_sec = config.requests_per_minute as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(config.burst as f64);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    config: Mutex<RateLimitConfig>,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    cleanup_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Mutex::new(config),
            buckets: DashMap::new(),
            cleanup_interval: Duration::from_secs(60),
        }
    }

    /// Atomic take-one. Returns whether a token existed.
    pub async fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1).await
    }

    /// Atomic take-n, all-or-nothing.
    pub async fn allow_n(&self, key: &str, n: u32) -> bool {
        let config = *self.config.lock().await;
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(config.burst))))
            .clone();

        let mut bucket = bucket.lock().await;
        bucket.refill(&config);
        bucket.last_touched = Instant::now();

        if bucket.tokens >= n as f64 {
            bucket.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    pub async fn update_config(&self, config: RateLimitConfig) {
        *self.config.lock().await = config;
    }

    /// Evict buckets untouched for `cleanup_interval`.
    pub fn cleanup(&self) {
        let cutoff = Instant::now() - self.cleanup_interval;
        self.buckets.retain(|_, bucket| {
            bucket
                .try_lock()
                .map(|b| b.last_touched > cutoff)
                .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_burst_then_denies() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 3,
        });

        assert!(limiter.allow("client").await);
        assert!(limiter.allow("client").await);
        assert!(limiter.allow("client").await);
        assert!(!limiter.allow("client").await);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 6000,
            burst: 1,
        });

        assert!(limiter.allow("client").await);
        assert!(!limiter.allow("client").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.allow("client").await);
    }

    #[tokio::test]
    async fn allow_n_is_all_or_nothing() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 5,
        });

        assert!(!limiter.allow_n("client", 10).await);
        assert!(limiter.allow_n("client", 5).await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 1,
        });

        assert!(limiter.allow("a").await);
        assert!(limiter.allow("b").await);
        assert!(!limiter.allow("a").await);
    }
}
