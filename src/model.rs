//! Domain types shared across components (spec §3).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Btc,
    Eth,
    Sol,
}

/// A normalized, chain-agnostic notification of a newly seen block.
/// Immutable after creation; owned by the ingestion component and handed
/// by value to the broadcaster and cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub hash: String,
    pub height: u64,
    pub chain: Chain,
    /// Event time at the upstream source.
    pub timestamp: String,
    /// Time this relay process observed the event.
    pub detected_at: String,
    pub relay_time_ms: f64,
    pub source: String,
    pub tier: String,
}

/// Service tier, coarsest capability class the relay recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Business,
    Turbo,
    Enterprise,
}

impl Tier {
    /// Subscriber channel buffer capacity for this tier (spec §3).
    pub fn buffer_capacity(self) -> usize {
        match self {
            Tier::Free => 512,
            Tier::Pro => 1280,
            Tier::Business => 1536,
            Tier::Turbo => 2048,
            Tier::Enterprise => 4096,
        }
    }

    /// Whether a full buffer overwrites its oldest slot (paid tiers) or
    /// drops the incoming event (Free tier) — spec §4.L flush semantics.
    pub fn overwrites_on_full_buffer(self) -> bool {
        !matches!(self, Tier::Free)
    }
}

/// Per-URL upstream health record (spec §3). Created on first observation
/// of a URL; persists for the process lifetime; `Reset` clears all fields.
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub url: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_millis: Option<u64>,
    pub last_failure_millis: Option<u64>,
    pub next_retry_millis: u64,
    pub current_backoff: Duration,
}

impl EndpointStatus {
    pub fn new(url: String, initial_backoff: Duration) -> Self {
        Self {
            url,
            success_count: 0,
            failure_count: 0,
            last_success_millis: None,
            last_failure_millis: None,
            next_retry_millis: 0,
            current_backoff: initial_backoff,
        }
    }

    /// `successes / (successes + failures)` when the denominator is
    /// positive, else `1.0` (no observations yet implies no evidence of
    /// failure).
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_buffer_capacities_match_spec() {
        assert_eq!(Tier::Free.buffer_capacity(), 512);
        assert_eq!(Tier::Pro.buffer_capacity(), 1280);
        assert_eq!(Tier::Business.buffer_capacity(), 1536);
        assert_eq!(Tier::Turbo.buffer_capacity(), 2048);
        assert_eq!(Tier::Enterprise.buffer_capacity(), 4096);
    }

    #[test]
    fn free_tier_drops_instead_of_overwriting() {
        assert!(!Tier::Free.overwrites_on_full_buffer());
        assert!(Tier::Enterprise.overwrites_on_full_buffer());
    }

    #[test]
    fn success_rate_is_one_with_no_observations() {
        let status = EndpointStatus::new("https://example".into(), Duration::from_secs(1));
        assert_eq!(status.success_rate(), 1.0);
    }
}
