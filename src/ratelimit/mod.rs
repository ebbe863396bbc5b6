//! Per-client token buckets.
//!
//! Each client key owns one bucket, created full on first sight. A request
//! refills the bucket for the time elapsed since the last refill, capped at
//! capacity, then takes one token if there is one.

mod middleware;

pub use middleware::{client_key, enforce};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const MIN_IDLE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_access: now,
        }
    }

    fn try_take(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) -> bool {
        self.last_access = now;

        let elapsed = now.saturating_duration_since(self.last_refill);
        let tokens_to_add = elapsed.as_secs_f64() * refill_per_sec;
        if tokens_to_add > 0.0 {
            self.tokens = (self.tokens + tokens_to_add).min(capacity);
            self.last_refill = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    capacity: u32,
    refill_per_sec: f64,
    trust_proxy_headers: bool,
    idle_ttl: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        // An idle bucket is only dropped once it would have refilled anyway.
        let refill_time = if refill_per_sec > 0.0 {
            Duration::try_from_secs_f64(f64::from(capacity) / refill_per_sec)
                .unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };

        Self {
            buckets: Arc::new(DashMap::new()),
            capacity,
            refill_per_sec,
            trust_proxy_headers: false,
            idle_ttl: refill_time.max(MIN_IDLE_TTL),
        }
    }

    /// Honour `X-Real-IP` / `X-Forwarded-For` when deriving client keys.
    #[must_use]
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    #[must_use]
    pub fn trusts_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    /// Admits or rejects one request for `key`.
    #[must_use]
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Same as [`admit`](Self::admit) with an explicit clock reading.
    #[must_use]
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        let capacity = f64::from(self.capacity);

        // The shard write lock held by the guard serialises the
        // read-modify-write for this key.
        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.try_take(now, capacity, self.refill_per_sec);
        }

        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(capacity, now));
        bucket.try_take(now, capacity, self.refill_per_sec)
    }

    /// Drops buckets idle for longer than the reaping TTL. Returns how many
    /// were removed.
    pub fn reap_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let ttl = self.idle_ttl;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_access) < ttl);
        before.saturating_sub(self.buckets.len())
    }

    pub fn reap_idle(&self) -> usize {
        self.reap_idle_at(Instant::now())
    }

    pub fn start_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let removed = limiter.reap_idle();
                if removed > 0 {
                    tracing::debug!("reaped {removed} idle rate-limit buckets");
                }
            }
        })
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_then_denied() {
        let limiter = RateLimiter::new(3, 1.0);
        let now = Instant::now();

        assert!(limiter.admit_at("client", now));
        assert!(limiter.admit_at("client", now));
        assert!(limiter.admit_at("client", now));
        assert!(!limiter.admit_at("client", now));
    }

    #[test]
    fn test_denial_does_not_deduct() {
        let limiter = RateLimiter::new(1, 1.0);
        let start = Instant::now();

        assert!(limiter.admit_at("client", start));
        assert!(!limiter.admit_at("client", start));
        assert!(!limiter.admit_at("client", start + Duration::from_millis(500)));
        // Half a token carried over, plus half from this interval.
        assert!(limiter.admit_at("client", start + Duration::from_millis(1000)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(2, 1.0);
        let now = Instant::now();

        assert!(limiter.admit_at("client1", now));
        assert!(limiter.admit_at("client1", now));
        assert!(!limiter.admit_at("client1", now));

        assert!(limiter.admit_at("client2", now));
        assert!(limiter.admit_at("client2", now));
        assert!(!limiter.admit_at("client2", now));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let limiter = RateLimiter::new(2, 1.0);
        let start = Instant::now();

        assert!(limiter.admit_at("client", start));
        assert!(limiter.admit_at("client", start));

        let later = start + Duration::from_secs(3600);
        assert!(limiter.admit_at("client", later));
        assert!(limiter.admit_at("client", later));
        assert!(!limiter.admit_at("client", later));
    }

    #[test]
    fn test_fractional_refill_rate() {
        let limiter = RateLimiter::new(1, 0.5);
        let start = Instant::now();

        assert!(limiter.admit_at("client", start));
        assert!(!limiter.admit_at("client", start + Duration::from_secs(1)));
        assert!(limiter.admit_at("client", start + Duration::from_secs(2)));
    }

    #[test]
    fn test_zero_capacity_denies() {
        let limiter = RateLimiter::new(0, 1.0);
        assert!(!limiter.admit("client"));
    }

    #[test]
    fn test_reap_idle() {
        let limiter = RateLimiter::new(5, 1.0);
        let start = Instant::now();

        let _ = limiter.admit_at("old", start);
        let _ = limiter.admit_at("fresh", start + limiter.idle_ttl());
        assert_eq!(limiter.bucket_count(), 2);

        let removed = limiter.reap_idle_at(start + limiter.idle_ttl() + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_idle_ttl_covers_slow_refill() {
        assert_eq!(RateLimiter::new(10, 1.0).idle_ttl(), MIN_IDLE_TTL);
        assert_eq!(
            RateLimiter::new(1000, 1.0).idle_ttl(),
            Duration::from_secs(1000)
        );
    }

    #[tokio::test]
    async fn test_concurrent_access_never_over_admits() {
        let limiter = Arc::new(RateLimiter::new(10, 0.001));

        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..5 {
                    if limiter.admit("shared") {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 10);
    }
}
