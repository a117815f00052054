//! Tier policy (spec §4.M): a static table mapping each service tier to its
//! request/stream/data-size limits, plus the token-bucket rate limiter
//! subjects are checked against. The table itself is read-only at runtime;
//! only the Enterprise row may be overridden at startup from configuration.
//!
//! Reuses the teacher's `TokenBucket`/`TokenStore` (`src/rate_limit/
//! strategies.rs`, `src/rate_limit/store.rs`) unchanged — only the HTTP
//! middleware wrapping them (`RateLimitLayer`/`RateLimitService`) is out of
//! scope here, since this crate has no HTTP surface of its own.

use crate::config::{TierEntry, TierTable};
use crate::model::Tier;
use crate::rate_limit::store::InMemoryTokenStore;
use crate::rate_limit::strategies::TokenBucket;
use crate::rate_limit::{Decision, RateLimiter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn entry_for(table: &TierTable, tier: Tier) -> &TierEntry {
    match tier {
        Tier::Free => &table.free,
        Tier::Pro => &table.pro,
        Tier::Business => &table.business,
        Tier::Turbo => &table.turbo,
        Tier::Enterprise => &table.enterprise,
    }
}

/// Per-subject, per-tier token buckets backing the static tier table.
/// `subject` is whatever the caller uses to key a rate-limited principal
/// (an API key, a connection id); buckets are created lazily on first use.
pub struct TierPolicy {
    table: TierTable,
    buckets: Mutex<HashMap<String, Arc<TokenBucket<InMemoryTokenStore>>>>,
}

impl TierPolicy {
    pub fn new(table: TierTable) -> Self {
        Self { table, buckets: Mutex::new(HashMap::new()) }
    }

    /// Overrides the Enterprise row at startup; the other rows stay fixed.
    pub fn with_enterprise_override(mut self, entry: TierEntry) -> Self {
        self.table.enterprise = entry;
        self
    }

    pub fn entry(&self, tier: Tier) -> TierEntry {
        *entry_for(&self.table, tier)
    }

    fn bucket_for(&self, subject: &str, tier: Tier) -> Arc<TokenBucket<InMemoryTokenStore>> {
        let mut buckets = self.buckets.lock().unwrap();
        let key = format!("{subject}:{tier:?}");
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                let entry = self.entry(tier);
                Arc::new(TokenBucket::new(InMemoryTokenStore::new(), key, entry.refill_rate_per_sec, entry.burst_capacity))
            })
            .clone()
    }

    /// Checks whether `subject` may spend `permits` requests under `tier`'s
    /// token bucket.
    pub async fn check(&self, subject: &str, tier: Tier, permits: u32) -> Decision {
        let bucket = self.bucket_for(subject, tier);
        bucket.acquire(permits).await.unwrap_or(Decision::Denied {
            wait: std::time::Duration::from_millis(100),
            reason: "rate_limiter_error".into(),
        })
    }

    /// Whether `size_bytes` fits within `tier`'s per-payload data cap.
    pub fn within_data_cap(&self, tier: Tier, size_bytes: u64) -> bool {
        size_bytes <= self.entry(tier).data_size_cap_mb * 1024 * 1024
    }

    /// Whether `current_streams + 1` still fits `tier`'s concurrent-stream
    /// limit.
    pub fn allows_additional_stream(&self, tier: Tier, current_streams: usize) -> bool {
        current_streams < self.entry(tier).concurrent_streams
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(TierTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enterprise_override_replaces_only_that_row() {
        let mut overridden = TierTable::default().enterprise;
        overridden.requests_per_sec = 999.0;
        let policy = TierPolicy::new(TierTable::default()).with_enterprise_override(overridden);
        assert_eq!(policy.entry(Tier::Enterprise).requests_per_sec, 999.0);
        assert_eq!(policy.entry(Tier::Free).requests_per_sec, TierTable::default().free.requests_per_sec);
    }

    #[tokio::test]
    async fn bucket_denies_once_burst_is_exhausted() {
        let policy = TierPolicy::default();
        let mut last = Decision::Denied { wait: std::time::Duration::ZERO, reason: String::new() };
        for _ in 0..30 {
            last = policy.check("subject-a", Tier::Free, 1).await;
        }
        assert!(!last.is_allowed());
    }

    #[test]
    fn data_cap_checks_megabytes() {
        let policy = TierPolicy::default();
        assert!(policy.within_data_cap(Tier::Free, 5 * 1024 * 1024));
        assert!(!policy.within_data_cap(Tier::Free, 20 * 1024 * 1024));
    }

    #[test]
    fn stream_limit_is_exclusive_of_the_new_stream() {
        let policy = TierPolicy::default();
        assert!(policy.allows_additional_stream(Tier::Free, 1));
        assert!(!policy.allows_additional_stream(Tier::Free, 2));
    }
}
