//! Prometheus-backed telemetry sink, feature-gated behind `metrics`.
//! Labels are kept fixed-cardinality (`policy`, `event`) per spec §9
//! ("Metrics labels are fixed cardinality to bound memory").

#![cfg(feature = "metrics")]

use crate::telemetry::{BreakerEvent, BroadcastEvent, CacheEvent, RelayEvent, ThrottleEvent};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_service::Service;

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Registers `relay_events_total{policy,event}` into `registry`.
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("relay_events_total", "Relay core events"),
            &["policy", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Service<RelayEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        let (policy, event) = match &event {
            RelayEvent::Cache(c) => (
                "cache",
                match c {
                    CacheEvent::Hit { .. } => "hit",
                    CacheEvent::Miss { .. } => "miss",
                    CacheEvent::Admitted { .. } => "admitted",
                    CacheEvent::Rejected { .. } => "rejected",
                    CacheEvent::SingleFlightCoalesced { .. } => "coalesced",
                    CacheEvent::SwrStaleServed { .. } => "swr_stale",
                    CacheEvent::SwrRefreshed { .. } => "swr_refreshed",
                    CacheEvent::SwrRefreshFailed { .. } => "swr_refresh_failed",
                },
            ),
            RelayEvent::Breaker(b) => (
                "breaker",
                match b {
                    BreakerEvent::Opened { .. } => "opened",
                    BreakerEvent::HalfOpen { .. } => "half_open",
                    BreakerEvent::Closed { .. } => "closed",
                    BreakerEvent::ForcedOpen { .. } => "forced_open",
                    BreakerEvent::ForcedClosed { .. } => "forced_closed",
                },
            ),
            RelayEvent::Throttle(t) => (
                "throttle",
                match t {
                    ThrottleEvent::Throttled { .. } => "throttled",
                    ThrottleEvent::Recovered { .. } => "recovered",
                },
            ),
            RelayEvent::Broadcast(b) => (
                "broadcast",
                match b {
                    BroadcastEvent::Delivered { .. } => "delivered",
                    BroadcastEvent::Overwritten { .. } => "overwritten",
                    BroadcastEvent::Dropped { .. } => "dropped",
                    BroadcastEvent::BatchDropped => "batch_dropped",
                },
            ),
        };
        self.counter.with_label_values(&[policy, event]).inc();
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::emit_best_effort;

    #[tokio::test]
    async fn records_an_event_under_its_labels() {
        let registry = Registry::new();
        let mut sink = PrometheusSink::new(registry).unwrap();
        emit_best_effort(&mut sink, RelayEvent::Cache(CacheEvent::Hit { key: "k".into() })).await;
        let families = sink.registry().gather();
        let family = families.iter().find(|f| f.name() == "relay_events_total").unwrap();
        assert_eq!(family.get_metric()[0].get_counter().value(), 1.0);
    }
}
