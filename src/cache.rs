//! Enterprise cache façade (spec §4.K): `Get`/`Set`/`GetOrLoad`/`GetSWR`
//! plus chain-latest-block storage, wired over the sharded LRU backend,
//! TinyLFU admission, and an optional Bloom pre-filter. Single-flight
//! coalescing follows the same `Arc<Mutex<HashMap<..>>>` plus notify shape
//! the teacher uses for its background-worker-plus-channel sinks, adapted
//! here to request/response instead of fire-and-forget. Background workers
//! are spawned explicitly via `spawn_workers`, never from the constructor
//! (spec §9 Design Notes).

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::RelayError;
use crate::lru::{CacheBackend, ShardedLru};
use crate::model::{BlockEvent, Chain};
use crate::telemetry::{CacheEvent, RelayEvent, TelemetrySink};
use crate::tinylfu::{Doorkeeper, TinyLfu};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tower_service::Service;

const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize)]
struct StoredValue {
    value: Vec<u8>,
    hard_expires_at_millis: u64,
    soft_expires_at_millis: u64,
    negative: bool,
}

fn encode(value: Vec<u8>, now: u64, hard_ttl: Duration, soft_ttl: Option<Duration>, negative: bool) -> Vec<u8> {
    let hard_expires_at_millis = now + hard_ttl.as_millis() as u64;
    let soft_expires_at_millis = soft_ttl.map(|s| now + s.as_millis() as u64).unwrap_or(hard_expires_at_millis);
    serde_json::to_vec(&StoredValue { value, hard_expires_at_millis, soft_expires_at_millis, negative })
        .expect("StoredValue serialization cannot fail")
}

fn decode(bytes: &[u8]) -> Option<StoredValue> {
    serde_json::from_slice(bytes).ok()
}

struct InFlight {
    notify: tokio::sync::Notify,
    result: Mutex<Option<Result<Vec<u8>, RelayError>>>,
}

#[derive(Debug, Default)]
struct CacheStats {
    total: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    bloom_rejections: AtomicU64,
    coalesced: AtomicU64,
    swr_stale_served: AtomicU64,
    swr_refreshed: AtomicU64,
    swr_refresh_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub total: u64,
    pub hits: u64,
    pub misses: u64,
    pub bloom_rejections: u64,
    pub coalesced: u64,
    pub swr_stale_served: u64,
    pub swr_refreshed: u64,
    pub swr_refresh_failed: u64,
    pub entries: usize,
    pub bytes: u64,
}

struct StoredBlock {
    payload: Vec<u8>,
    compressed: bool,
    expires_at_millis: u64,
    access_count: AtomicU64,
    last_accessed_millis: AtomicU64,
}

pub struct EnterpriseCache<S = crate::telemetry::NullSink> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<ShardedLru>,
    admission: Arc<TinyLfu>,
    bloom: Option<Arc<Mutex<Doorkeeper>>>,
    single_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    latest_block: RwLock<HashMap<Chain, StoredBlock>>,
    stats: Arc<CacheStats>,
    telemetry: Mutex<S>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl EnterpriseCache<crate::telemetry::NullSink> {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_telemetry(config, clock, crate::telemetry::NullSink)
    }
}

impl<S> EnterpriseCache<S>
where
    S: Service<RelayEvent, Response = ()> + Clone + Send + 'static,
{
    pub fn with_telemetry(config: CacheConfig, clock: Arc<dyn Clock>, telemetry: S) -> Self {
        let admission = Arc::new(TinyLfu::new(config.bloom_size, config.bloom_hashes));
        let shard_entries = (config.max_entries / config.shard_count.max(1)).max(1);
        let backend = Arc::new(ShardedLru::new(config.shard_count, shard_entries, clock.clone(), admission.clone()));
        let bloom = config
            .enable_bloom_filter
            .then(|| Arc::new(Mutex::new(Doorkeeper::new(config.bloom_size, config.bloom_hashes))));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            config,
            clock,
            backend,
            admission,
            bloom,
            single_flight: Mutex::new(HashMap::new()),
            latest_block: RwLock::new(HashMap::new()),
            stats: Arc::new(CacheStats::default()),
            telemetry: Mutex::new(telemetry),
            shutdown_tx,
        }
    }

    async fn emit(&self, event: RelayEvent) {
        let mut sink = self.telemetry.lock().unwrap().clone();
        crate::telemetry::emit_best_effort(&mut sink, event).await;
    }

    /// `Get(key) -> (value, ok)`.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.stats.total.fetch_add(1, Ordering::SeqCst);

        if let Some(bloom) = &self.bloom {
            if !bloom.lock().unwrap().contains(key) {
                self.stats.bloom_rejections.fetch_add(1, Ordering::SeqCst);
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayEvent::Cache(CacheEvent::Miss { key: key.to_string() })).await;
                return None;
            }
        }

        match self.backend.get(key).and_then(|bytes| decode(&bytes)) {
            Some(stored) if !stored.negative && self.clock.now_millis() < stored.hard_expires_at_millis => {
                self.stats.hits.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayEvent::Cache(CacheEvent::Hit { key: key.to_string() })).await;
                Some(stored.value)
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                self.emit(RelayEvent::Cache(CacheEvent::Miss { key: key.to_string() })).await;
                None
            }
        }
    }

    /// `Set(key, value, ttl)`.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = self.clock.now_millis();
        let encoded = encode(value, now, ttl, None, false);
        let admitted = self.backend.set(key, encoded, ttl);
        if let Some(bloom) = &self.bloom {
            bloom.lock().unwrap().add(key);
        }
        self.admission.touch(key);
        if admitted {
            self.emit(RelayEvent::Cache(CacheEvent::Admitted { key: key.to_string(), reason: "stored" })).await;
        } else {
            self.emit(RelayEvent::Cache(CacheEvent::Rejected { key: key.to_string(), reason: "tinylfu_admission" }))
                .await;
        }
        self.maybe_request_eviction();
    }

    fn maybe_request_eviction(&self) {
        let stats = self.backend.stats();
        let pressure = stats.bytes as f64 / self.config.memory_limit_bytes.max(1) as f64;
        if pressure > self.config.memory_threshold {
            tracing::debug!(pressure, "cache memory pressure above threshold, eviction requested");
        }
    }

    /// `GetOrLoad(ctx, key, ttl, loader)`: single-flight-coalesced load.
    pub async fn get_or_load<Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: impl FnOnce() -> Fut,
    ) -> Result<Vec<u8>, RelayError>
    where
        Fut: Future<Output = Result<Vec<u8>, RelayError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let (is_leader, entry) = {
            let mut flights = self.single_flight.lock().unwrap();
            if let Some(existing) = flights.get(key) {
                self.stats.coalesced.fetch_add(1, Ordering::SeqCst);
                (false, existing.clone())
            } else {
                let fresh = Arc::new(InFlight { notify: tokio::sync::Notify::new(), result: Mutex::new(None) });
                flights.insert(key.to_string(), fresh.clone());
                (true, fresh)
            }
        };

        if !is_leader {
            self.emit(RelayEvent::Cache(CacheEvent::SingleFlightCoalesced { key: key.to_string() })).await;
            entry.notify.notified().await;
            return entry.result.lock().unwrap().clone().unwrap_or(Err(RelayError::Canceled));
        }

        if let Some(value) = self.get(key).await {
            self.single_flight.lock().unwrap().remove(key);
            entry.notify.notify_waiters();
            return Ok(value);
        }

        let result = loader().await;
        if let Ok(value) = &result {
            self.set(key, value.clone(), ttl).await;
        }
        *entry.result.lock().unwrap() = Some(result.clone());
        self.single_flight.lock().unwrap().remove(key);
        entry.notify.notify_waiters();
        result
    }

    /// `GetSWR(ctx, key, loader, hardTTL, softTTL) -> (value, wasHit, err)`.
    pub async fn get_swr<Fut>(
        &self,
        key: &str,
        loader: impl FnOnce() -> Fut + Send + 'static,
        hard_ttl: Duration,
        soft_ttl: Duration,
    ) -> Result<(Vec<u8>, bool), RelayError>
    where
        Fut: Future<Output = Result<Vec<u8>, RelayError>> + Send + 'static,
        S: Send,
    {
        self.stats.total.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now_millis();
        let existing = self.backend.get(key).and_then(|bytes| decode(&bytes));

        if let Some(stored) = &existing {
            if !stored.negative && now < stored.hard_expires_at_millis {
                self.stats.hits.fetch_add(1, Ordering::SeqCst);
                return Ok((stored.value.clone(), true));
            }
            if !stored.negative && now < stored.soft_expires_at_millis {
                self.stats.swr_stale_served.fetch_add(1, Ordering::SeqCst);
                let stale = stored.value.clone();
                self.emit(RelayEvent::Cache(CacheEvent::SwrStaleServed { key: key.to_string() })).await;
                self.spawn_background_refresh(key.to_string(), loader, hard_ttl, soft_ttl);
                return Ok((stale, true));
            }
        }

        match loader().await {
            Ok(value) => {
                let now = self.clock.now_millis();
                let encoded = encode(value.clone(), now, hard_ttl, Some(soft_ttl), false);
                let admitted = self.backend.set(key, encoded, hard_ttl);
                if let Some(bloom) = &self.bloom {
                    bloom.lock().unwrap().add(key);
                }
                if admitted {
                    self.emit(RelayEvent::Cache(CacheEvent::Admitted { key: key.to_string(), reason: "swr_store" }))
                        .await;
                } else {
                    self.emit(RelayEvent::Cache(CacheEvent::Rejected {
                        key: key.to_string(),
                        reason: "tinylfu_admission",
                    }))
                    .await;
                }
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                Ok((value, false))
            }
            Err(RelayError::NotFound) => {
                let now = self.clock.now_millis();
                let encoded = encode(Vec::new(), now, NEGATIVE_CACHE_TTL, None, true);
                self.backend.set(key, encoded, NEGATIVE_CACHE_TTL);
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::NotFound)
            }
            Err(err) => {
                self.stats.misses.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn spawn_background_refresh<Fut>(
        &self,
        key: String,
        loader: impl FnOnce() -> Fut + Send + 'static,
        hard_ttl: Duration,
        soft_ttl: Duration,
    ) where
        Fut: Future<Output = Result<Vec<u8>, RelayError>> + Send + 'static,
    {
        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let bloom = self.bloom.clone();
        let stats = self.stats.clone();
        let mut telemetry = self.telemetry.lock().unwrap().clone();
        tokio::spawn(async move {
            match loader().await {
                Ok(value) => {
                    let now = clock.now_millis();
                    let encoded = encode(value, now, hard_ttl, Some(soft_ttl), false);
                    let admitted = backend.set(&key, encoded, hard_ttl);
                    if let Some(bloom) = &bloom {
                        bloom.lock().unwrap().add(&key);
                    }
                    if admitted {
                        crate::telemetry::emit_best_effort(
                            &mut telemetry,
                            RelayEvent::Cache(CacheEvent::Admitted { key: key.clone(), reason: "swr_refresh" }),
                        )
                        .await;
                    } else {
                        crate::telemetry::emit_best_effort(
                            &mut telemetry,
                            RelayEvent::Cache(CacheEvent::Rejected { key: key.clone(), reason: "tinylfu_admission" }),
                        )
                        .await;
                    }
                    stats.swr_refreshed.fetch_add(1, Ordering::SeqCst);
                    crate::telemetry::emit_best_effort(
                        &mut telemetry,
                        RelayEvent::Cache(CacheEvent::SwrRefreshed { key }),
                    )
                    .await;
                }
                Err(_) => {
                    stats.swr_refresh_failed.fetch_add(1, Ordering::SeqCst);
                    crate::telemetry::emit_best_effort(
                        &mut telemetry,
                        RelayEvent::Cache(CacheEvent::SwrRefreshFailed { key }),
                    )
                    .await;
                }
            }
        });
    }

    /// `SetLatestBlock(block)`. Compresses the serialized payload with
    /// gzip when it exceeds `compression_threshold_bytes`; decompression at
    /// `GetLatestBlock` always works from a defensive copy.
    pub fn set_latest_block(&self, block: &BlockEvent, ttl: Duration) -> Result<(), RelayError> {
        let serialized = serde_json::to_vec(block).map_err(|e| RelayError::Internal { reason: e.to_string() })?;
        let (payload, compressed) = if serialized.len() > self.config.compression_threshold_bytes
            && self.config.compression_type == crate::config::CompressionType::Gzip
        {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&serialized).map_err(|e| RelayError::Internal { reason: e.to_string() })?;
            (encoder.finish().map_err(|e| RelayError::Internal { reason: e.to_string() })?, true)
        } else {
            (serialized, false)
        };

        let now = self.clock.now_millis();
        let stored = StoredBlock {
            payload,
            compressed,
            expires_at_millis: now + ttl.as_millis() as u64,
            access_count: AtomicU64::new(0),
            last_accessed_millis: AtomicU64::new(now),
        };
        self.latest_block.write().unwrap().insert(block.chain, stored);
        Ok(())
    }

    /// `GetLatestBlock() -> (block, ok)`.
    pub fn get_latest_block(&self, chain: Chain) -> Option<BlockEvent> {
        let now = self.clock.now_millis();
        let blocks = self.latest_block.read().unwrap();
        let stored = blocks.get(&chain)?;
        if now > stored.expires_at_millis {
            return None;
        }
        stored.access_count.fetch_add(1, Ordering::SeqCst);
        stored.last_accessed_millis.store(now, Ordering::SeqCst);

        let raw = if stored.compressed {
            let mut decoder = GzDecoder::new(stored.payload.as_slice());
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            out
        } else {
            stored.payload.clone()
        };
        serde_json::from_slice(&raw).ok()
    }

    pub fn metrics(&self) -> CacheMetrics {
        let backend_stats = self.backend.stats();
        CacheMetrics {
            total: self.stats.total.load(Ordering::SeqCst),
            hits: self.stats.hits.load(Ordering::SeqCst),
            misses: self.stats.misses.load(Ordering::SeqCst),
            bloom_rejections: self.stats.bloom_rejections.load(Ordering::SeqCst),
            coalesced: self.stats.coalesced.load(Ordering::SeqCst),
            swr_stale_served: self.stats.swr_stale_served.load(Ordering::SeqCst),
            swr_refreshed: self.stats.swr_refreshed.load(Ordering::SeqCst),
            swr_refresh_failed: self.stats.swr_refresh_failed.load(Ordering::SeqCst),
            entries: backend_stats.entries,
            bytes: backend_stats.bytes,
        }
    }

    /// Spawns the cleanup/metrics/GC background workers (spec §4.K).
    /// Never called automatically; the supervisor owns these handles.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>>
    where
        S: Send,
    {
        let mut handles = Vec::new();

        let cache = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(cache.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = cache.clock.now_millis();
                        cache.latest_block.write().unwrap().retain(|_, b| now <= b.expires_at_millis);
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        let cache = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let m = cache.metrics();
                        tracing::debug!(hits = m.hits, misses = m.misses, "cache metrics");
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        let cache = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => cache.maybe_request_eviction(),
                    _ = shutdown.recv() => break,
                }
            }
        }));

        handles
    }

    /// `Shutdown(ctx)`. Signals workers, then closes the backend; callers
    /// that have already joined a single-flight group still observe their
    /// result.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> EnterpriseCache {
        EnterpriseCache::new(CacheConfig { shard_count: 2, max_entries: 100, ..CacheConfig::default() }, ManualClock::new())
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = cache();
        cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn bloom_filter_short_circuits_unknown_keys() {
        let cache = cache();
        assert_eq!(cache.get("never-set").await, None);
        assert_eq!(cache.metrics().bloom_rejections, 1);
    }

    #[tokio::test]
    async fn get_or_load_coalesces_concurrent_callers() {
        let cache = Arc::new(cache());
        let calls = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("k", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(b"loaded".to_vec())
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), b"loaded".to_vec());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_swr_serves_stale_then_refreshes() {
        let clock = ManualClock::new();
        let cache = EnterpriseCache::new(CacheConfig::default(), clock.clone());
        cache
            .get_swr(
                "k",
                || async { Ok(b"v1".to_vec()) },
                Duration::from_secs(10),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3));
        let (value, was_hit) = cache
            .get_swr(
                "k",
                || async { Ok(b"v2".to_vec()) },
                Duration::from_secs(10),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(value, b"v1".to_vec());
        assert!(was_hit);
        assert_eq!(cache.metrics().swr_stale_served, 1);
    }

    #[tokio::test]
    async fn get_swr_negative_caches_not_found() {
        let cache = cache();
        let result = cache
            .get_swr("missing", || async { Err(RelayError::NotFound) }, Duration::from_secs(10), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(RelayError::NotFound)));
    }

    #[test]
    fn latest_block_round_trips_uncompressed() {
        let cache = cache();
        let block = BlockEvent {
            hash: "0xabc".into(),
            height: 100,
            chain: Chain::Eth,
            timestamp: "t".into(),
            detected_at: "t".into(),
            relay_time_ms: 1.0,
            source: "s".into(),
            tier: "pro".into(),
        };
        cache.set_latest_block(&block, Duration::from_secs(60)).unwrap();
        let fetched = cache.get_latest_block(Chain::Eth).unwrap();
        assert_eq!(fetched.hash, "0xabc");
    }

    #[test]
    fn latest_block_compresses_large_payloads() {
        let mut cache_config = CacheConfig::default();
        cache_config.compression_type = crate::config::CompressionType::Gzip;
        cache_config.compression_threshold_bytes = 10;
        let cache = EnterpriseCache::new(cache_config, ManualClock::new());
        let block = BlockEvent {
            hash: "0".repeat(500),
            height: 1,
            chain: Chain::Btc,
            timestamp: "t".into(),
            detected_at: "t".into(),
            relay_time_ms: 1.0,
            source: "s".into(),
            tier: "enterprise".into(),
        };
        cache.set_latest_block(&block, Duration::from_secs(60)).unwrap();
        let fetched = cache.get_latest_block(Chain::Btc).unwrap();
        assert_eq!(fetched.hash.len(), 500);
    }

    #[test]
    fn expired_latest_block_returns_none() {
        let clock = ManualClock::new();
        let cache = EnterpriseCache::new(CacheConfig::default(), clock.clone());
        let block = BlockEvent {
            hash: "h".into(),
            height: 1,
            chain: Chain::Sol,
            timestamp: "t".into(),
            detected_at: "t".into(),
            relay_time_ms: 1.0,
            source: "s".into(),
            tier: "free".into(),
        };
        cache.set_latest_block(&block, Duration::from_millis(10)).unwrap();
        clock.advance(Duration::from_millis(20));
        assert!(cache.get_latest_block(Chain::Sol).is_none());
    }
}
