use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 🪣 One token bucket per (purpose, key).
///
/// `allow(purpose, key, limit, burst, window)` lets through `limit` events per `window`,
/// with up to `burst` of them saved up. A fresh bucket starts full.
#[derive(Debug, Default)]
pub struct KeyedRateLimiter {
    buckets: Mutex<HashMap<(String, String), TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl KeyedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, purpose: &str, key: &str, limit: u32, burst: u32, window: Duration) -> bool {
        self.allow_at(Instant::now(), purpose, key, limit, burst, window)
    }

    /// ⏱️ Same as `allow`, on a clock you bring yourself.
    pub fn allow_at(
        &self,
        now: Instant,
        purpose: &str,
        key: &str,
        limit: u32,
        burst: u32,
        window: Duration,
    ) -> bool {
        if window.is_zero() || limit == 0 {
            return true;
        }
        let capacity = f64::from(burst.max(1));
        let per_second = f64::from(limit) / window.as_secs_f64();

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((purpose.to_owned(), key.to_owned()))
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * per_second).min(capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// 🧹 Drop every bucket for `key`, whatever the purpose.
    pub fn forget(&self, key: &str) {
        self.buckets.lock().retain(|(_, k), _| k != key);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_one_vote_per_second_means_one() {
        let limiter = KeyedRateLimiter::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(1);

        assert!(limiter.allow_at(t0, "node_failure", "h1", 1, 1, window));
        assert!(!limiter.allow_at(t0 + Duration::from_millis(300), "node_failure", "h1", 1, 1, window));
        assert!(limiter.allow_at(t0 + Duration::from_millis(1100), "node_failure", "h1", 1, 1, window));
    }

    #[test]
    fn the_one_where_keys_and_purposes_dont_share_buckets() {
        let limiter = KeyedRateLimiter::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(1);

        assert!(limiter.allow_at(t0, "node_failure", "h1", 1, 1, window));
        assert!(limiter.allow_at(t0, "node_failure", "h2", 1, 1, window));
        assert!(limiter.allow_at(t0, "node_available", "h1", 1, 1, window));
        assert_eq!(limiter.len(), 3);

        limiter.forget("h1");
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn the_one_where_burst_saves_up_tokens() {
        let limiter = KeyedRateLimiter::new();
        let t0 = Instant::now();
        let window = Duration::from_secs(1);

        for _ in 0..3 {
            assert!(limiter.allow_at(t0, "p", "k", 1, 3, window));
        }
        assert!(!limiter.allow_at(t0, "p", "k", 1, 3, window));
    }
}
