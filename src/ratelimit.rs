//! Rate-limit decision interface (spec.md §5 "Rate limits"): per
//! (account, action) token buckets over `{pullblob, pushblob,
//! pullmanifest, pushmanifest, pullblobbytesanycast}`, the last charged
//! in bytes rather than requests. Replication callers are exempt by
//! spec.md's own wording — it is the caller's responsibility to skip
//! [`RateLimiter::check`] for those, the same way `anonymous_first_pull`
//! is a caller-side check rather than something this trait enforces.
//!
//! A production deployment backs this by a shared cache for a single-RTT
//! atomic increment (spec.md: "Redis-style"); no Redis client is
//! grounded anywhere in the corpus, so only the in-memory reference
//! implementation is provided here (see DESIGN.md) — `Config::redis_url`
//! remains an unconsumed ambient knob for that external driver to read.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    PullBlob,
    PushBlob,
    PullManifest,
    PushManifest,
    /// Anycast-forwarded blob bytes; `amount` passed to `check` is a byte
    /// count rather than 1 request.
    PullBlobBytesAnycast,
}

/// A per-action quota: `capacity` units refilled at `refill_per_second`.
/// The driver returning `None` for an action means unlimited (spec.md:
/// "The driver returns a quota or nil; nil means unlimited").
#[derive(Debug, Clone, Copy)]
pub struct RateLimitQuota {
    pub capacity: u64,
    pub refill_per_second: u64,
}

/// Whether a (account, action) request of `amount` units is allowed right
/// now; implementations must make the check-and-increment atomic.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, account: &str, action: RateLimitAction, amount: u64) -> bool;
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory token-bucket reference implementation. Quotas are supplied
/// once at construction per action (spec.md does not specify a
/// per-account override mechanism beyond the driver abstraction itself);
/// an action absent from `quotas` is unlimited.
pub struct InMemoryRateLimiter {
    quotas: HashMap<RateLimitAction, RateLimitQuota>,
    buckets: Mutex<HashMap<(String, RateLimitAction), Bucket>>,
}

impl InMemoryRateLimiter {
    pub fn new(quotas: HashMap<RateLimitAction, RateLimitQuota>) -> Self {
        Self { quotas, buckets: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, account: &str, action: RateLimitAction, amount: u64) -> bool {
        let Some(quota) = self.quotas.get(&action) else {
            return true;
        };
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets
            .entry((account.to_string(), action))
            .or_insert_with(|| Bucket { tokens: quota.capacity as f64, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * quota.refill_per_second as f64).min(quota.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= amount as f64 {
            bucket.tokens -= amount as f64;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_capacity_then_denies() {
        let mut quotas = HashMap::new();
        quotas.insert(RateLimitAction::PushBlob, RateLimitQuota { capacity: 2, refill_per_second: 0 });
        let limiter = InMemoryRateLimiter::new(quotas);

        assert!(limiter.check("acct", RateLimitAction::PushBlob, 1).await);
        assert!(limiter.check("acct", RateLimitAction::PushBlob, 1).await);
        assert!(!limiter.check("acct", RateLimitAction::PushBlob, 1).await);
    }

    #[tokio::test]
    async fn unconfigured_action_is_unlimited() {
        let limiter = InMemoryRateLimiter::new(HashMap::new());
        for _ in 0..1000 {
            assert!(limiter.check("acct", RateLimitAction::PullManifest, 1).await);
        }
    }

    #[tokio::test]
    async fn buckets_are_independent_per_account() {
        let mut quotas = HashMap::new();
        quotas.insert(RateLimitAction::PullBlob, RateLimitQuota { capacity: 1, refill_per_second: 0 });
        let limiter = InMemoryRateLimiter::new(quotas);

        assert!(limiter.check("acct-a", RateLimitAction::PullBlob, 1).await);
        assert!(!limiter.check("acct-a", RateLimitAction::PullBlob, 1).await);
        assert!(limiter.check("acct-b", RateLimitAction::PullBlob, 1).await);
    }

    #[tokio::test]
    async fn anycast_bytes_are_charged_by_amount() {
        let mut quotas = HashMap::new();
        quotas.insert(RateLimitAction::PullBlobBytesAnycast, RateLimitQuota { capacity: 1024, refill_per_second: 0 });
        let limiter = InMemoryRateLimiter::new(quotas);

        assert!(limiter.check("acct", RateLimitAction::PullBlobBytesAnycast, 1000).await);
        assert!(!limiter.check("acct", RateLimitAction::PullBlobBytesAnycast, 100).await);
    }
}
