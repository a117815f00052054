//! Component supervisor (spec §4.O): owns every long-lived component, wires
//! Clock/RNG, starts workers in leaves-first order, and tears everything
//! down in reverse with a bounded deadline. Follows the teacher's
//! explicit-construction-then-explicit-spawn discipline (nothing auto-starts
//! in a constructor) and ethhook's `JoinSet` + `broadcast::channel` shutdown
//! idiom for the bounded-deadline drain.

use crate::cache::EnterpriseCache;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::{BreakerConfig, CacheConfig, ThrottleConfig, TierTable};
use crate::broadcast::BroadcastHub;
use crate::error::RelayError;
use crate::ingestion::ChainAdapter;
use crate::model::BlockEvent;
use crate::sleeper::Sleeper;
use crate::throttle::EndpointThrottle;
use crate::tier::TierPolicy;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub struct SupervisorConfig {
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub throttle: ThrottleConfig,
    pub tier_table: TierTable,
    pub block_channel_buffer: usize,
    pub shutdown_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            throttle: ThrottleConfig::default(),
            tier_table: TierTable::default(),
            block_channel_buffer: 1024,
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// Wires and owns the relay's components. Construction order follows spec
/// §4.O: Clock, then backends, then admission, then cache, breakers,
/// throttle, broadcaster, and finally ingestion adapters — each later
/// component may depend on an earlier one, never the reverse.
pub struct Supervisor {
    clock: Arc<dyn Clock>,
    cache: Arc<EnterpriseCache>,
    cache_default_ttl: Duration,
    breakers: Arc<CircuitBreakerRegistry>,
    throttle: Arc<EndpointThrottle>,
    broadcaster: BroadcastHub,
    tier_policy: Arc<TierPolicy>,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    block_tx: mpsc::Sender<BlockEvent>,
    block_rx: Mutex<Option<mpsc::Receiver<BlockEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_deadline: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Builds every component without starting any background work.
    /// `adapters` are constructed by the caller (they may need transport
    /// handles this crate doesn't own) and handed in for wiring.
    pub fn new(config: SupervisorConfig, clock: Arc<dyn Clock>, adapters: Vec<Arc<dyn ChainAdapter>>) -> Arc<Self> {
        let cache_default_ttl = config.cache.default_ttl;
        let cache = Arc::new(EnterpriseCache::new(config.cache, clock.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker, clock.clone()));
        let throttle = Arc::new(EndpointThrottle::new(config.throttle, clock.clone()));
        let broadcaster = BroadcastHub::new();
        let tier_policy = Arc::new(TierPolicy::new(config.tier_table));
        let (block_tx, block_rx) = mpsc::channel(config.block_channel_buffer);
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            clock,
            cache,
            cache_default_ttl,
            breakers,
            throttle,
            broadcaster,
            tier_policy,
            adapters,
            block_tx,
            block_rx: Mutex::new(Some(block_rx)),
            shutdown_tx,
            shutdown_deadline: config.shutdown_deadline,
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn cache(&self) -> &Arc<EnterpriseCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn throttle(&self) -> &Arc<EndpointThrottle> {
        &self.throttle
    }

    pub fn broadcaster(&self) -> &BroadcastHub {
        &self.broadcaster
    }

    pub fn tier_policy(&self) -> &Arc<TierPolicy> {
        &self.tier_policy
    }

    /// Starts every background worker: cache maintenance, breaker
    /// maintenance, the broadcast batcher, the event pump that forwards
    /// ingested blocks into the cache and broadcaster, and finally the
    /// ingestion adapters themselves (last, since they're the only
    /// component that produces rather than serves data).
    pub fn start(self: &Arc<Self>, sleeper: Arc<dyn Sleeper>) {
        let mut handles = self.handles.lock().unwrap();
        handles.extend(self.cache.spawn_workers());
        handles.extend(self.breakers.spawn_all_workers());
        handles.extend(self.broadcaster.spawn_workers());

        let Some(block_rx) = self.block_rx.lock().unwrap().take() else {
            return;
        };
        handles.push(self.spawn_event_pump(block_rx));

        for adapter in &self.adapters {
            handles.push(self.spawn_adapter(adapter.clone(), sleeper.clone()));
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, mut block_rx: mpsc::Receiver<BlockEvent>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    event = block_rx.recv() => {
                        let Some(event) = event else { return };
                        let now = this.clock.now_millis();
                        this.broadcaster.publish(&event, now);
                        if let Err(err) = this.cache.set_latest_block(&event, this.cache_default_ttl) {
                            tracing::warn!(error = %err, "failed to cache latest block");
                        }
                    }
                }
            }
        })
    }

    fn spawn_adapter(self: &Arc<Self>, adapter: Arc<dyn ChainAdapter>, sleeper: Arc<dyn Sleeper>) -> JoinHandle<()> {
        let sink = self.block_tx.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let backoff = crate::backoff::ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            2.0,
            crate::jitter::Jitter::Full,
            Arc::new(crate::clock::SystemRng),
        );
        tokio::spawn(async move {
            crate::ingestion::run_with_reconnect(adapter, sink, shutdown_tx, backoff, sleeper).await;
        })
    }

    /// Reverse-order shutdown with a bounded deadline: broadcasts the
    /// shutdown signal once, then waits for every worker to exit. Workers
    /// still running past `shutdown_deadline` are abandoned and reported
    /// as a `Timeout`.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), RelayError> {
        let _ = self.shutdown_tx.send(());
        self.broadcaster.shutdown().await;

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(self.shutdown_deadline, drain).await {
            Ok(()) => Ok(()),
            Err(_) => Err(RelayError::Timeout { elapsed: self.shutdown_deadline, timeout: self.shutdown_deadline }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ingestion::MockAdapter;
    use crate::model::Chain;
    use crate::sleeper::InstantSleeper;

    #[tokio::test]
    async fn start_then_shutdown_drains_within_deadline() {
        let clock = ManualClock::new();
        let adapter: Arc<dyn ChainAdapter> = Arc::new(MockAdapter::new(Chain::Eth, Duration::from_millis(5), clock.clone()));
        let config = SupervisorConfig { shutdown_deadline: Duration::from_secs(2), ..SupervisorConfig::default() };
        let supervisor = Supervisor::new(config, clock, vec![adapter]);

        supervisor.start(Arc::new(InstantSleeper));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = supervisor.shutdown().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn supervisor_exposes_wired_components() {
        let clock = ManualClock::new();
        let supervisor = Supervisor::new(SupervisorConfig::default(), clock, Vec::new());
        assert_eq!(supervisor.cache().metrics().total, 0);
        assert!(supervisor.breakers().snapshot().is_empty());
    }
}
