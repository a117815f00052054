//! Configuration structs and their spec-mandated defaults (spec §6).

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionStrategy {
    Lru,
    /// Reserved; not implemented. Falls back to LRU (spec §9 Open Question).
    Lfu,
    Fifo,
    Random,
    Entropy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub max_entries: usize,
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    pub shard_count: usize,
    pub bloom_size: usize,
    pub bloom_hashes: u32,
    pub memory_limit_bytes: u64,
    pub memory_threshold: f64,
    pub compression_type: CompressionType,
    pub compression_threshold_bytes: usize,
    pub strategy: EvictionStrategy,
    pub enable_bloom_filter: bool,
    pub enable_circuit_breaker: bool,
    pub enable_metrics: bool,
    pub enable_warmup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 1 << 30,
            max_entries: 100_000,
            default_ttl: secs(5 * 60),
            cleanup_interval: secs(5 * 60),
            shard_count: 16,
            bloom_size: 100_000,
            bloom_hashes: 3,
            memory_limit_bytes: 2 << 30,
            memory_threshold: 0.95,
            compression_type: CompressionType::None,
            compression_threshold_bytes: 64 * 1024,
            strategy: EvictionStrategy::Lru,
            enable_bloom_filter: true,
            enable_circuit_breaker: true,
            enable_metrics: true,
            enable_warmup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub name: String,
    pub max_failures: usize,
    pub success_threshold: usize,
    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    pub half_open_max_calls: usize,
    pub min_samples: usize,
    pub enable_health_scoring: bool,
    /// Minimum call duration classified as `Latency` rather than `Error`
    /// (spec §4.G failure classification).
    #[serde(with = "duration_secs")]
    pub latency_threshold: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_failures: 5,
            success_threshold: 2,
            reset_timeout: secs(30),
            call_timeout: secs(5),
            half_open_max_calls: 2,
            min_samples: 10,
            enable_health_scoring: true,
            latency_threshold: secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_retries: usize,
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub success_threshold: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: secs(1),
            max_backoff: secs(5 * 60),
            backoff_multiplier: 2.0,
            success_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierEntry {
    pub requests_per_sec: f64,
    pub requests_per_hour: u64,
    pub concurrent_streams: usize,
    pub data_size_cap_mb: u64,
    pub key_generations_per_hour: u64,
    pub ws_messages_per_sec: f64,
    pub refill_rate_per_sec: f64,
    pub burst_capacity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTable {
    pub free: TierEntry,
    pub pro: TierEntry,
    pub business: TierEntry,
    pub turbo: TierEntry,
    pub enterprise: TierEntry,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierEntry {
                requests_per_sec: 5.0,
                requests_per_hour: 5_000,
                concurrent_streams: 2,
                data_size_cap_mb: 10,
                key_generations_per_hour: 1,
                ws_messages_per_sec: 5.0,
                refill_rate_per_sec: 5.0,
                burst_capacity: 25.0,
            },
            pro: TierEntry {
                requests_per_sec: 25.0,
                requests_per_hour: 50_000,
                concurrent_streams: 10,
                data_size_cap_mb: 100,
                key_generations_per_hour: 10,
                ws_messages_per_sec: 25.0,
                refill_rate_per_sec: 25.0,
                burst_capacity: 125.0,
            },
            business: TierEntry {
                requests_per_sec: 100.0,
                requests_per_hour: 150_000,
                concurrent_streams: 25,
                data_size_cap_mb: 500,
                key_generations_per_hour: 50,
                ws_messages_per_sec: 100.0,
                refill_rate_per_sec: 100.0,
                burst_capacity: 500.0,
            },
            turbo: TierEntry {
                requests_per_sec: 250.0,
                requests_per_hour: 300_000,
                concurrent_streams: 50,
                data_size_cap_mb: 2_000,
                key_generations_per_hour: 100,
                ws_messages_per_sec: 250.0,
                refill_rate_per_sec: 250.0,
                burst_capacity: 1_250.0,
            },
            // Example ENTERPRISE values given verbatim by spec §4.M.
            enterprise: TierEntry {
                requests_per_sec: 500.0,
                requests_per_hour: 500_000,
                concurrent_streams: 100,
                data_size_cap_mb: 5_000,
                key_generations_per_hour: 500,
                ws_messages_per_sec: 500.0,
                refill_rate_per_sec: 500.0 / 3600.0,
                burst_capacity: 2_500.0,
            },
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_config_defaults_match_spec() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.max_size_bytes, 1 << 30);
        assert_eq!(cfg.max_entries, 100_000);
        assert_eq!(cfg.shard_count, 16);
        assert_eq!(cfg.memory_threshold, 0.95);
    }

    #[test]
    fn enterprise_tier_matches_spec_example() {
        let table = TierTable::default();
        assert_eq!(table.enterprise.requests_per_sec, 500.0);
        assert_eq!(table.enterprise.concurrent_streams, 100);
        assert_eq!(table.enterprise.burst_capacity, 2_500.0);
    }
}
