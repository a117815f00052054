//! End-to-end exercises of the concrete scenarios the relay's core
//! components must satisfy: single-flight collapse, SWR stale-then-refresh,
//! circuit trip and recovery, backoff jitter bounds, broadcaster overwrite,
//! and endpoint throttle backoff.

use relay_core::{
    BreakerConfig, CacheConfig, Chain, CircuitBreaker, EndpointThrottle, EnterpriseCache, ExponentialBackoff,
    FakeRng, Jitter, ManualClock, RelayError, Tier, ThrottleConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn single_flight_collapses_concurrent_loaders() {
    let cache = Arc::new(EnterpriseCache::new(CacheConfig::default(), ManualClock::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let cache = cache.clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_load("k", Duration::from_secs(60), || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(b"ok".to_vec())
                    }
                })
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), b"ok".to_vec());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn swr_serves_stale_then_refreshes_in_background() {
    use relay_core::{CacheEvent, RelayEvent, StreamingSink};

    let clock = ManualClock::new();
    let (sink, mut events) = StreamingSink::new(16);
    let cache = Arc::new(EnterpriseCache::with_telemetry(CacheConfig::default(), clock.clone(), sink));

    let (value, was_hit) = cache
        .get_swr("s", || async { Ok(b"v1".to_vec()) }, Duration::from_millis(20), Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(value, b"v1");
    assert!(!was_hit);

    clock.advance(Duration::from_millis(30));

    let (value, was_hit) = cache
        .get_swr("s", || async { Ok(b"v2".to_vec()) }, Duration::from_millis(50), Duration::from_millis(400))
        .await
        .unwrap();
    assert_eq!(value, b"v1");
    assert!(was_hit);

    // Spec §8 scenario 2: "within 200 ms a refresh notification for key s is
    // delivered." Wait on the telemetry sink rather than sleeping blind.
    let notified = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match events.recv().await.unwrap() {
                RelayEvent::Cache(CacheEvent::SwrRefreshed { key }) if key == "s" => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(notified.is_ok(), "expected a refresh notification for key s within 200ms");

    let (value, _) = cache
        .get_swr("s", || async { Ok(b"unused".to_vec()) }, Duration::from_millis(50), Duration::from_millis(400))
        .await
        .unwrap();
    assert_eq!(value, b"v2");
}

#[tokio::test]
async fn circuit_trips_then_recovers_after_probes() {
    let clock = ManualClock::new();
    let config = BreakerConfig {
        max_failures: 3,
        reset_timeout: Duration::from_millis(100),
        half_open_max_calls: 2,
        success_threshold: 2,
        ..BreakerConfig::default()
    };
    let breaker = CircuitBreaker::new(config, clock.clone());

    for _ in 0..3 {
        let result = breaker.execute(|| async { Err::<(), _>(RelayError::Internal { reason: "boom".into() }) }).await;
        assert!(result.is_err());
    }

    let result = breaker.execute(|| async { Ok::<_, RelayError>(()) }).await;
    assert!(matches!(result, Err(RelayError::CircuitOpen { .. })));

    clock.advance(Duration::from_millis(100));

    for _ in 0..2 {
        let result = breaker.execute(|| async { Ok::<_, RelayError>(()) }).await;
        assert!(result.is_ok());
    }

    assert!(breaker.metrics().state_changes >= 2);
}

#[tokio::test]
async fn backoff_jitter_stays_within_doubling_bounds() {
    let backoff = ExponentialBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(160),
        2.0,
        Jitter::Full,
        FakeRng::new(0.999),
    );
    let expected_caps_ms = [10, 20, 40, 80, 160];
    for cap in expected_caps_ms {
        let delay = backoff.next_delay();
        assert!(delay.as_millis() < cap, "{delay:?} should be under {cap}ms");
    }
}

#[tokio::test]
async fn broadcaster_overwrites_paid_tier_and_drops_free_tier() {
    use relay_core::{BlockEvent, BroadcastHub};

    let hub = BroadcastHub::new();
    let handles = hub.spawn_workers();
    let enterprise = hub.subscribe(Tier::Enterprise);
    let free = hub.subscribe(Tier::Free);

    for i in 0..5000u64 {
        let event = BlockEvent {
            hash: format!("{i:x}"),
            height: i,
            chain: Chain::Eth,
            timestamp: "t".into(),
            detected_at: "t".into(),
            relay_time_ms: 0.0,
            source: "mock".into(),
            tier: "enterprise".into(),
        };
        hub.publish(&event, 0);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    hub.shutdown().await;
    for handle in handles {
        let _ = handle.await;
    }

    let metrics = hub.metrics();
    assert!(metrics.overwritten > 0);
    let _ = (enterprise, free);
}

#[tokio::test]
async fn endpoint_throttle_backoff_caps_and_resets_on_success() {
    let clock = ManualClock::new();
    let config = ThrottleConfig {
        initial_backoff: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        max_backoff: Duration::from_secs(8),
        ..ThrottleConfig::default()
    };
    let throttle = EndpointThrottle::new(config, clock.clone());

    for _ in 0..5 {
        throttle.record_failure("https://endpoint");
    }
    let status = throttle.status("https://endpoint").unwrap();
    assert_eq!(status.current_backoff, Duration::from_secs(8));

    throttle.record_success("https://endpoint");
    let status = throttle.status("https://endpoint").unwrap();
    assert_eq!(status.current_backoff, Duration::from_secs(1));
}
