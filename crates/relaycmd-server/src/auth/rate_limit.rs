//! Sliding-window rate limiter for auth attempts.
//!
//! Per-key attempt timestamps that expire after a rolling window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

/// A rate limiter with configurable per-key limits and window duration.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: usize,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → list of attempt timestamps.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;

        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;

        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }
}

/// Auth attempts: max 5 per minute per remote IP.
#[derive(Debug)]
pub struct AuthRateLimit {
    limiter: RateLimiter,
}

impl Default for AuthRateLimit {
    fn default() -> Self {
        Self {
            limiter: RateLimiter::new(5, Duration::from_secs(60)),
        }
    }
}

impl AuthRateLimit {
    /// Check if an auth attempt from the given IP is allowed.
    pub fn check(&mut self, ip: &IpAddr) -> bool {
        self.limiter.check_and_record(&ip.to_string())
    }

    pub fn gc(&mut self) {
        self.limiter.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sixth_attempt_in_window_refused() {
        let mut limits = AuthRateLimit::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limits.check(&ip));
        }
        assert!(!limits.check(&ip));

        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limits.check(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record("k"));
        assert!(limiter.check_and_record("k"));
        assert!(!limiter.check_and_record("k"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check_and_record("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn gc_drops_idle_keys() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        limiter.check_and_record("a");
        limiter.check_and_record("b");
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.gc();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
