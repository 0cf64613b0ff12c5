// src/ratelimit/mod.rs
//! Token-bucket rate limiting per `(tenant_id, api_key_id)`, backed by a
//! `moka` cache via `providers::MokaKeyValueCache` and a pair of atomics per
//! bucket for the refill/consume counters. On cache failure the limiter
//! opens the circuit rather than denying traffic.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::providers::{KeyValueCache, MokaKeyValueCache};

/// Refills continuously at `refill_per_second`, capped at `capacity`. The
/// bucket's state is a pair of atomics rather than a `Mutex<f64>` so a
/// lookup never blocks another request's lookup.
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens_milli: AtomicI64,
    last_refill_millis: AtomicU64,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_second: u32) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_second: refill_per_second as f64,
            tokens_milli: AtomicI64::new((capacity as i64) * 1000),
            last_refill_millis: AtomicU64::new(now_millis()),
        }
    }

    /// Attempts to take one token. Returns `Ok(())` if allowed, or
    /// `Err(retry_after_secs)` if the bucket is empty.
    fn try_acquire(&self) -> Result<(), u64> {
        let now = now_millis();
        let last = self.last_refill_millis.swap(now, Ordering::AcqRel);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1000.0;
        let refill_milli = (elapsed_secs * self.refill_per_second * 1000.0) as i64;
        let cap_milli = (self.capacity * 1000.0) as i64;

        let mut current = self.tokens_milli.load(Ordering::Acquire);
        loop {
            let refilled = (current + refill_milli).min(cap_milli);
            let after_take = refilled - 1000;
            if after_take < 0 {
                let deficit_milli = -after_take;
                let retry_secs = (deficit_milli as f64 / 1000.0 / self.refill_per_second.max(0.001)).ceil() as u64;
                return Err(retry_secs.max(1));
            }
            match self.tokens_milli.compare_exchange_weak(
                current,
                after_take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rps: u32,
    pub burst: u32,
}

/// One limiter instance per bucket class: chat/embeddings share a bucket,
/// job endpoints use a separate, higher-limit bucket.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<dyn KeyValueCache<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(MokaKeyValueCache::new(10_000)),
        }
    }

    /// `Ok(())` if the request may proceed; `Err(retry_after_secs)` otherwise.
    /// Never errors outright: a cache miss just means a fresh bucket at full
    /// capacity is created, so limiter unavailability never blocks traffic.
    pub fn check(&self, tenant_id: &str, api_key_id: &str) -> Result<(), u64> {
        let key = format!("{}:{}", tenant_id, api_key_id);
        let bucket = match self.buckets.get(&key) {
            Some(bucket) => bucket,
            None => {
                let bucket = Arc::new(TokenBucket::new(self.config.burst, self.config.rps));
                self.buckets.insert(key, Arc::clone(&bucket));
                bucket
            }
        };
        bucket.try_acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig { rps: 10, burst: 5 });
        for _ in 0..5 {
            assert!(limiter.check("t1", "k1").is_ok());
        }
    }

    #[test]
    fn denies_once_burst_is_exhausted() {
        let limiter = RateLimiter::new(RateLimitConfig { rps: 1, burst: 2 });
        assert!(limiter.check("t1", "k1").is_ok());
        assert!(limiter.check("t1", "k1").is_ok());
        assert!(limiter.check("t1", "k1").is_err());
    }

    #[test]
    fn buckets_are_independent_per_tenant_key_pair() {
        let limiter = RateLimiter::new(RateLimitConfig { rps: 1, burst: 1 });
        assert!(limiter.check("t1", "k1").is_ok());
        assert!(limiter.check("t2", "k1").is_ok());
        assert!(limiter.check("t1", "k1").is_err());
    }
}
