// src/middleware/rate_limit.rs - Per-client token bucket rate limiting
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::time::Instant;

use crate::middleware::{DenyReason, Verdict};

/// Buckets are evicted once the map grows past this many clients; anything
/// idle for more than two refill windows goes first. Keeps the map bounded
/// under address churn.
const MAX_TRACKED_CLIENTS: usize = 16_384;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by client IP.
///
/// Buckets refill continuously at `capacity / window` tokens per second and
/// are created lazily with a full budget, so a client gets exactly
/// `rate_limit` connections in any window of `per_seconds` and the next one
/// is denied.
pub struct RateLimiter {
    capacity: f64,
    window_secs: f64,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_limit: u32, per_seconds: u64) -> Self {
        Self {
            capacity: f64::from(rate_limit),
            window_secs: per_seconds as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Spend one token for `client`, refilling for elapsed time first.
    pub fn check(&self, client: IpAddr) -> Verdict {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");

        if buckets.len() >= MAX_TRACKED_CLIENTS && !buckets.contains_key(&client) {
            Self::evict_idle(&mut buckets, now, self.window_secs);
        }

        let bucket = buckets.entry(client).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * (self.capacity / self.window_secs)).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            tracing::debug!(%client, tokens_left = bucket.tokens, "rate limiter: allowed");
            Verdict::Allow
        } else {
            tracing::warn!(%client, "rate limiter: denied, limit exceeded");
            Verdict::Deny(DenyReason::RateLimited)
        }
    }

    fn evict_idle(buckets: &mut HashMap<IpAddr, Bucket>, now: Instant, window_secs: f64) {
        let idle_cutoff = window_secs * 2.0;
        buckets.retain(|_, b| now.duration_since(b.last_refill).as_secs_f64() < idle_cutoff);
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}
