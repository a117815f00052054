//! Relay-wide event telemetry. Generalizes the teacher's `PolicyEvent`/
//! `TelemetrySink` pattern to the relay's own event surface: cache
//! admission, SWR refresh, single-flight coalescing, breaker transitions,
//! endpoint throttle decisions, and broadcaster drops.

use crate::model::Tier;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower_service::Service;

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit { key: String },
    Miss { key: String },
    Admitted { key: String, reason: &'static str },
    Rejected { key: String, reason: &'static str },
    SingleFlightCoalesced { key: String },
    SwrStaleServed { key: String },
    SwrRefreshed { key: String },
    SwrRefreshFailed { key: String },
}

#[derive(Debug, Clone)]
pub enum BreakerEvent {
    Opened { name: String, failure_count: usize },
    HalfOpen { name: String },
    Closed { name: String },
    ForcedOpen { name: String },
    ForcedClosed { name: String },
}

#[derive(Debug, Clone)]
pub enum ThrottleEvent {
    Throttled { url: String },
    Recovered { url: String },
}

#[derive(Debug, Clone)]
pub enum BroadcastEvent {
    Delivered { tier: Tier },
    Overwritten { tier: Tier },
    Dropped { tier: Tier },
    BatchDropped,
}

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Cache(CacheEvent),
    Breaker(BreakerEvent),
    Throttle(ThrottleEvent),
    Broadcast(BroadcastEvent),
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A sink consumes `RelayEvent`s as a `tower_service::Service`, matching
/// the teacher's telemetry shape so composition (`MulticastSink`,
/// `FallbackSink`) works uniformly.
pub trait TelemetrySink:
    Service<RelayEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

impl<T, E> TelemetrySink for T
where
    T: Service<RelayEvent, Response = (), Error = E> + Clone + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type SinkError = E;
}

/// Emits an event, discarding any sink error — telemetry is best-effort
/// and must never fail the call path that produced the event.
pub async fn emit_best_effort<S>(sink: &mut S, event: RelayEvent)
where
    S: Service<RelayEvent, Response = ()>,
{
    if futures::future::poll_fn(|cx| sink.poll_ready(cx)).await.is_ok() {
        let _ = sink.call(event).await;
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("telemetry sink error")]
pub struct NeverError;

/// A sink that discards every event.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl Service<RelayEvent> for NullSink {
    type Response = ();
    type Error = NeverError;
    type Future = Pin<Box<dyn Future<Output = Result<(), NeverError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), NeverError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RelayEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// Logs every event via `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl Service<RelayEvent> for LogSink {
    type Response = ();
    type Error = NeverError;
    type Future = Pin<Box<dyn Future<Output = Result<(), NeverError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), NeverError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        tracing::info!(event = %event, "relay event");
        Box::pin(async { Ok(()) })
    }
}

/// Bounded in-memory sink for tests: records events FIFO, tracking the
/// number evicted once the cap is hit.
#[derive(Clone)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<RelayEvent>>>,
    cap: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new(cap: usize) -> Self {
        Self { events: Arc::new(Mutex::new(VecDeque::new())), cap, evicted: Arc::new(AtomicU64::new(0)) }
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::SeqCst)
    }
}

impl Service<RelayEvent> for MemorySink {
    type Response = ();
    type Error = NeverError;
    type Future = Pin<Box<dyn Future<Output = Result<(), NeverError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), NeverError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.cap {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComposedSinkError<A, B> {
    #[error("first sink failed: {0}")]
    First(A),
    #[error("second sink failed: {0}")]
    Second(B),
}

/// Fans an event out to two sinks concurrently.
#[derive(Clone)]
pub struct MulticastSink<A, B> {
    a: A,
    b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A, B> Service<RelayEvent> for MulticastSink<A, B>
where
    A: Service<RelayEvent, Response = ()> + Clone + Send + 'static,
    A::Future: Send,
    A::Error: std::error::Error + Send + Sync + 'static,
    B: Service<RelayEvent, Response = ()> + Clone + Send + 'static,
    B::Future: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = ();
    type Error = ComposedSinkError<A::Error, B::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        let mut a = self.a.clone();
        let mut b = self.b.clone();
        let event_b = event.clone();
        Box::pin(async move {
            let (ra, rb) = tokio::join!(a.call(event), b.call(event_b));
            ra.map_err(ComposedSinkError::First)?;
            rb.map_err(ComposedSinkError::Second)?;
            Ok(())
        })
    }
}

/// Tries the primary sink; on failure, tries the fallback.
#[derive(Clone)]
pub struct FallbackSink<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> FallbackSink<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A, B> Service<RelayEvent> for FallbackSink<A, B>
where
    A: Service<RelayEvent, Response = ()> + Clone + Send + 'static,
    A::Future: Send,
    B: Service<RelayEvent, Response = ()> + Clone + Send + 'static,
    B::Future: Send,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = ();
    type Error = B::Error;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        let mut primary = self.primary.clone();
        let mut fallback = self.fallback.clone();
        let event_fb = event.clone();
        Box::pin(async move {
            if primary.call(event).await.is_ok() {
                return Ok(());
            }
            fallback.call(event_fb).await
        })
    }
}

/// Streams events to subscribers via a `tokio::sync::broadcast` channel,
/// tracking drops when the channel has no capacity left.
#[derive(Clone)]
pub struct StreamingSink {
    sender: tokio::sync::broadcast::Sender<RelayEvent>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<RelayEvent>) {
        let (sender, receiver) = tokio::sync::broadcast::channel(capacity);
        (Self { sender, dropped: Arc::new(AtomicU64::new(0)) }, receiver)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Service<RelayEvent> for StreamingSink {
    type Response = ();
    type Error = NeverError;
    type Future = Pin<Box<dyn Future<Output = Result<(), NeverError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), NeverError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RelayEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        emit_best_effort(&mut sink, RelayEvent::Cache(CacheEvent::Hit { key: "k".into() })).await;
    }

    #[tokio::test]
    async fn memory_sink_records_and_evicts() {
        let mut sink = MemorySink::new(2);
        for i in 0..3 {
            emit_best_effort(&mut sink, RelayEvent::Cache(CacheEvent::Miss { key: i.to_string() })).await;
        }
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.evicted(), 1);
    }

    #[tokio::test]
    async fn multicast_sink_delivers_to_both() {
        let a = MemorySink::new(10);
        let b = MemorySink::new(10);
        let mut multicast = MulticastSink::new(a.clone(), b.clone());
        emit_best_effort(&mut multicast, RelayEvent::Throttle(ThrottleEvent::Throttled { url: "u".into() })).await;
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[tokio::test]
    async fn streaming_sink_tracks_drops_with_no_subscribers() {
        let (mut sink, rx) = StreamingSink::new(4);
        drop(rx);
        emit_best_effort(&mut sink, RelayEvent::Broadcast(BroadcastEvent::BatchDropped)).await;
        assert_eq!(sink.dropped(), 1);
    }
}
