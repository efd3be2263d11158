//! Per-device send throttling using the governor crate.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

type DeviceLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct Bucket {
    limiter: Arc<DeviceLimiter>,
    last_used: Instant,
}

/// One token bucket per device, created on first use.
///
/// Callers over the rate wait for a token; nothing is ever rejected. The
/// bucket count is bounded: idle buckets go first, then the least recently
/// used.
pub struct SendRateLimiter {
    quota: Quota,
    buckets: DashMap<String, Bucket>,
    max_buckets: usize,
    idle_after: Duration,
}

impl SendRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);

        Self {
            quota: Quota::per_second(per_second).allow_burst(burst),
            buckets: DashMap::new(),
            max_buckets: config.max_buckets.max(1),
            idle_after: Duration::from_secs(config.idle_eviction_secs),
        }
    }

    /// Wait until `device_id` may send one more message
    pub async fn consume(&self, device_id: &str, recipient: &str) {
        let limiter = self.bucket(device_id);
        if limiter.check().is_ok() {
            return;
        }

        tracing::trace!(device_id, recipient, "Send throttled, waiting for a token");
        limiter.until_ready().await;
    }

    fn bucket(&self, device_id: &str) -> Arc<DeviceLimiter> {
        let now = Instant::now();
        if let Some(mut bucket) = self.buckets.get_mut(device_id) {
            bucket.last_used = now;
            return bucket.limiter.clone();
        }

        if self.buckets.len() >= self.max_buckets {
            self.make_room(now);
        }

        let quota = self.quota;
        let mut bucket = self
            .buckets
            .entry(device_id.to_string())
            .or_insert_with(|| Bucket {
                limiter: Arc::new(RateLimiter::direct(quota)),
                last_used: now,
            });
        bucket.last_used = now;
        bucket.limiter.clone()
    }

    fn make_room(&self, now: Instant) {
        let evicted = self.evict_idle_at(now);
        if evicted > 0 && self.buckets.len() < self.max_buckets {
            return;
        }

        while self.buckets.len() >= self.max_buckets {
            let oldest = self
                .buckets
                .iter()
                .min_by_key(|entry| entry.value().last_used)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(device_id) => {
                    self.buckets.remove(&device_id);
                    tracing::debug!(device_id = %device_id, "Evicted least recently used send bucket");
                }
                None => break,
            }
        }
    }

    /// Drop buckets unused for longer than the idle window
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let idle_after = self.idle_after;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_used) < idle_after);
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle send buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn has_bucket(&self, device_id: &str) -> bool {
        self.buckets.contains_key(device_id)
    }
}
