//! Process-wide admission gate: a token bucket shared by every webhook handler.

use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter. Construct once at startup and share behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Bucket starts full. Capacity is at least one token.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_second)
    }

    /// Take one token if available. Never waits.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // saturating: callers may race and pass a `now` older than the last refill
        let elapsed = now
            .saturating_duration_since(bucket.last_refill)
            .as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
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
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
