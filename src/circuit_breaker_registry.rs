//! Registry of per-endpoint circuit breakers, keyed by endpoint URL.
//! Generalizes the teacher's id-keyed `CircuitBreakerRegistry` (which held
//! a bare `CircuitBreakerState`) to hold full `CircuitBreaker` instances so
//! each endpoint's breaker carries its own sliding window, latency
//! detector, and adaptive threshold.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::BreakerConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    clock: Arc<dyn Clock>,
    default_config: BreakerConfig,
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { clock, default_config, inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Returns the breaker for `endpoint`, creating one from `default_config`
    /// (with its name set to `endpoint`) the first time it's seen.
    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap();
        if let Some(breaker) = map.get(endpoint) {
            return breaker.clone();
        }
        let mut config = self.default_config.clone();
        config.name = endpoint.to_string();
        let breaker = Arc::new(CircuitBreaker::new(config, self.clock.clone()));
        map.insert(endpoint.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, endpoint: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.lock().unwrap().get(endpoint).cloned()
    }

    pub fn reset(&self, endpoint: &str) -> Result<(), String> {
        match self.get(endpoint) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(format!("no breaker registered for endpoint: {endpoint}")),
        }
    }

    /// Snapshot of every registered endpoint's current state, sorted by URL.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Spawns background workers for every currently registered breaker.
    pub fn spawn_all_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .flat_map(|breaker| breaker.spawn_workers())
            .collect()
    }
}
