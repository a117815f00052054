//! Fan-out broadcaster (spec §4.L). Frames are encoded once and handed to
//! a single batcher task (grounded in the Solana `broadcast_stage.rs`
//! single-stage-fans-out-to-many shape from `other_examples`), which
//! flushes on a 5ms tick or a 64-frame batch, whichever comes first.
//! Per-subscriber delivery needs "pop oldest, push new" for paid tiers,
//! which `tokio::mpsc` can't do — so subscriber channels are a small
//! ring buffer behind a `Notify`, generalizing the teacher's
//! `StreamingSink` (broadcast channel plus drop counter) to support that
//! overwrite policy.

use crate::model::{BlockEvent, Tier};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const BATCH_CHANNEL_CAPACITY: usize = 1000;
const BATCH_FLUSH_SIZE: usize = 64;
const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Serialize)]
struct Frame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    block: &'a BlockEvent,
    timestamp: String,
}

/// Formats epoch milliseconds as RFC3339, falling back to the current wall
/// clock if the value is out of `chrono`'s representable range.
fn rfc3339_millis(epoch_millis: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_millis as i64).unwrap_or_else(chrono::Utc::now).to_rfc3339()
}

fn encode_frame(event: &BlockEvent, now_millis: u64) -> Arc<Vec<u8>> {
    let frame = Frame { kind: "block_event", block: event, timestamp: rfc3339_millis(now_millis) };
    Arc::new(serde_json::to_vec(&frame).expect("BlockEvent serialization cannot fail"))
}

struct SubscriberChannel {
    buffer: Mutex<VecDeque<Arc<Vec<u8>>>>,
    capacity: usize,
    notify: tokio::sync::Notify,
    closed: AtomicBool,
    tier: Tier,
}

impl SubscriberChannel {
    fn new(tier: Tier) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(tier.buffer_capacity())),
            capacity: tier.buffer_capacity(),
            notify: tokio::sync::Notify::new(),
            closed: AtomicBool::new(false),
            tier,
        }
    }

    fn push(&self, frame: Arc<Vec<u8>>) -> DeliveryOutcome {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() < self.capacity {
            buffer.push_back(frame);
            drop(buffer);
            self.notify.notify_one();
            return DeliveryOutcome::Delivered;
        }

        if self.tier.overwrites_on_full_buffer() {
            buffer.pop_front();
            buffer.push_back(frame);
            drop(buffer);
            self.notify.notify_one();
            DeliveryOutcome::Overwritten
        } else {
            DeliveryOutcome::Dropped
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Delivered,
    Overwritten,
    Dropped,
}

/// Receive handle returned by `subscribe`.
pub struct Subscription {
    id: u64,
    channel: Arc<SubscriberChannel>,
    hub: Arc<BroadcastHubInner>,
}

impl Subscription {
    /// Awaits the next frame, or `None` once unsubscribed/shut down.
    pub async fn recv(&self) -> Option<Arc<Vec<u8>>> {
        loop {
            {
                let mut buffer = self.channel.buffer.lock().unwrap();
                if let Some(frame) = buffer.pop_front() {
                    return Some(frame);
                }
            }
            if self.channel.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.channel.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastMetrics {
    pub delivered: u64,
    pub overwritten: u64,
    pub dropped: u64,
    pub batch_dropped: u64,
}

type EventCallback = Arc<dyn Fn(crate::telemetry::BroadcastEvent) + Send + Sync>;

struct BroadcastHubInner {
    subscribers: RwLock<HashMap<u64, Arc<SubscriberChannel>>>,
    next_id: AtomicU64,
    batch_tx: tokio::sync::mpsc::Sender<Arc<Vec<u8>>>,
    batch_rx: Mutex<Option<tokio::sync::mpsc::Receiver<Arc<Vec<u8>>>>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    delivered: AtomicU64,
    overwritten: AtomicU64,
    dropped: AtomicU64,
    batch_dropped: AtomicU64,
    on_event: Mutex<Option<EventCallback>>,
}

impl BroadcastHubInner {
    fn unsubscribe(&self, id: u64) {
        if let Some(channel) = self.subscribers.write().unwrap().remove(&id) {
            channel.close();
        }
    }

    fn emit(&self, event: crate::telemetry::BroadcastEvent) {
        if let Some(cb) = self.on_event.lock().unwrap().clone() {
            cb(event);
        }
    }
}

/// Fan-out broadcaster. Cheaply cloneable; every clone shares the same
/// subscriber table and batcher.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<BroadcastHubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (batch_tx, batch_rx) = tokio::sync::mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            inner: Arc::new(BroadcastHubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                batch_tx,
                batch_rx: Mutex::new(Some(batch_rx)),
                shutdown_tx,
                delivered: AtomicU64::new(0),
                overwritten: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                batch_dropped: AtomicU64::new(0),
                on_event: Mutex::new(None),
            }),
        }
    }

    pub fn on_event<F: Fn(crate::telemetry::BroadcastEvent) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.on_event.lock().unwrap() = Some(Arc::new(f));
    }

    /// `Subscribe(tier)`.
    pub fn subscribe(&self, tier: Tier) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(SubscriberChannel::new(tier));
        self.inner.subscribers.write().unwrap().insert(id, channel.clone());
        Subscription { id, channel, hub: self.inner.clone() }
    }

    /// `Unsubscribe` is implicit on `Subscription` drop; exposed here too
    /// for callers that track ids separately.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.unsubscribe(subscription.id);
    }

    /// `Publish(event)`: encodes once, hands the frame to the batcher.
    /// Drops (and counts) the broadcast if the batch channel itself is
    /// saturated.
    pub fn publish(&self, event: &BlockEvent, now_millis: u64) {
        let frame = encode_frame(event, now_millis);
        if self.inner.batch_tx.try_send(frame).is_err() {
            self.inner.batch_dropped.fetch_add(1, Ordering::SeqCst);
            self.inner.emit(crate::telemetry::BroadcastEvent::BatchDropped);
        }
    }

    fn flush(inner: &Arc<BroadcastHubInner>, batch: &mut Vec<Arc<Vec<u8>>>) {
        if batch.is_empty() {
            return;
        }
        let subscribers: Vec<Arc<SubscriberChannel>> = inner.subscribers.read().unwrap().values().cloned().collect();
        for frame in batch.drain(..) {
            for channel in &subscribers {
                let tier = channel.tier;
                match channel.push(frame.clone()) {
                    DeliveryOutcome::Delivered => {
                        inner.delivered.fetch_add(1, Ordering::SeqCst);
                        inner.emit(crate::telemetry::BroadcastEvent::Delivered { tier });
                    }
                    DeliveryOutcome::Overwritten => {
                        inner.overwritten.fetch_add(1, Ordering::SeqCst);
                        inner.emit(crate::telemetry::BroadcastEvent::Overwritten { tier });
                    }
                    DeliveryOutcome::Dropped => {
                        inner.dropped.fetch_add(1, Ordering::SeqCst);
                        inner.emit(crate::telemetry::BroadcastEvent::Dropped { tier });
                    }
                }
            }
        }
    }

    /// Spawns the batcher task. Not called automatically; the supervisor
    /// owns the handle and the shutdown broadcast that stops it.
    pub fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let Some(mut batch_rx) = self.inner.batch_rx.lock().unwrap().take() else {
            return Vec::new();
        };
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        vec![tokio::spawn(async move {
            let mut batch = Vec::with_capacity(BATCH_FLUSH_SIZE);
            let mut tick = tokio::time::interval(BATCH_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        Self::flush(&inner, &mut batch);
                        break;
                    }
                    frame = batch_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                batch.push(frame);
                                if batch.len() >= BATCH_FLUSH_SIZE {
                                    Self::flush(&inner, &mut batch);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        Self::flush(&inner, &mut batch);
                    }
                }
            }
        })]
    }

    pub fn metrics(&self) -> BroadcastMetrics {
        BroadcastMetrics {
            delivered: self.inner.delivered.load(Ordering::SeqCst),
            overwritten: self.inner.overwritten.load(Ordering::SeqCst),
            dropped: self.inner.dropped.load(Ordering::SeqCst),
            batch_dropped: self.inner.batch_dropped.load(Ordering::SeqCst),
        }
    }

    /// Stops the batcher (flushing any pending batch first) and closes
    /// every subscriber channel.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        for channel in self.inner.subscribers.write().unwrap().drain() {
            channel.1.close();
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(hash: &str) -> BlockEvent {
        BlockEvent {
            hash: hash.to_string(),
            height: 1,
            chain: crate::model::Chain::Eth,
            timestamp: "t".into(),
            detected_at: "t".into(),
            relay_time_ms: 1.0,
            source: "s".into(),
            tier: "pro".into(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_frame() {
        let hub = BroadcastHub::new();
        let handles = hub.spawn_workers();
        let sub = hub.subscribe(Tier::Pro);
        hub.publish(&block("a"), 0);
        let frame = sub.recv().await.unwrap();
        assert!(!frame.is_empty());
        hub.shutdown().await;
        for h in handles {
            let _ = h.await;
        }
    }

    #[tokio::test]
    async fn free_tier_drops_when_full_paid_tier_overwrites() {
        let free = SubscriberChannel::new(Tier::Free);
        let enterprise = SubscriberChannel::new(Tier::Enterprise);
        for i in 0..Tier::Free.buffer_capacity() {
            assert_eq!(free.push(Arc::new(vec![i as u8])), DeliveryOutcome::Delivered);
        }
        assert_eq!(free.push(Arc::new(vec![255])), DeliveryOutcome::Dropped);

        for i in 0..Tier::Enterprise.buffer_capacity() {
            assert_eq!(enterprise.push(Arc::new(vec![i as u8])), DeliveryOutcome::Delivered);
        }
        assert_eq!(enterprise.push(Arc::new(vec![255])), DeliveryOutcome::Overwritten);
    }

    #[tokio::test]
    async fn dropping_subscription_closes_its_channel() {
        let hub = BroadcastHub::new();
        let id = {
            let sub = hub.subscribe(Tier::Pro);
            sub.channel.clone()
        };
        assert!(!id.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = BroadcastHub::new();
        let handles = hub.spawn_workers();
        let sub = hub.subscribe(Tier::Pro);
        hub.unsubscribe(&sub);
        hub.publish(&block("a"), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sub.recv().await, None);
        hub.shutdown().await;
        for h in handles {
            let _ = h.await;
        }
    }
}
