//! Bucketed success/failure/latency statistics (spec §4.B).

use crate::clock::Clock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Bucket {
    timestamp_millis: u64,
    requests: u64,
    successes: u64,
    failures: u64,
    latency_sum: Duration,
    latency_count: u64,
    min_latency: Duration,
    max_latency: Duration,
}

impl Bucket {
    fn new(timestamp_millis: u64) -> Self {
        Self {
            timestamp_millis,
            requests: 0,
            successes: 0,
            failures: 0,
            latency_sum: Duration::ZERO,
            latency_count: 0,
            min_latency: Duration::MAX,
            max_latency: Duration::ZERO,
        }
    }

    fn fold(&mut self, success: bool, latency: Duration) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.latency_sum += latency;
        self.latency_count += 1;
        self.min_latency = self.min_latency.min(latency);
        self.max_latency = self.max_latency.max(latency);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStatistics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub failure_rate: f64,
    pub avg_latency: Duration,
}

struct Inner {
    buckets: Vec<Bucket>,
    current_index: usize,
    last_update_millis: u64,
}

pub struct SlidingWindow {
    bucket_size: Duration,
    window_size: Duration,
    bucket_count: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl SlidingWindow {
    pub fn new(window_size: Duration, bucket_size: Duration, clock: Arc<dyn Clock>) -> Self {
        let bucket_size = if bucket_size.is_zero() { Duration::from_millis(1) } else { bucket_size };
        let bucket_count = ((window_size.as_secs_f64() / bucket_size.as_secs_f64()).ceil() as usize).max(1);
        let now = clock.now_millis();
        let mut buckets = Vec::with_capacity(bucket_count);
        for i in 0..bucket_count {
            buckets.push(Bucket::new(now.saturating_sub((bucket_count - 1 - i) as u64 * bucket_size.as_millis() as u64)));
        }
        Self {
            bucket_size,
            window_size,
            bucket_count,
            clock,
            inner: Mutex::new(Inner { buckets, current_index: bucket_count - 1, last_update_millis: now }),
        }
    }

    fn rotate_locked(&self, inner: &mut Inner, now_millis: u64) {
        let bucket_millis = self.bucket_size.as_millis().max(1) as u64;
        let elapsed = now_millis.saturating_sub(inner.last_update_millis);
        let steps = elapsed / bucket_millis;
        if steps == 0 {
            return;
        }
        if steps as usize >= self.bucket_count {
            for (i, bucket) in inner.buckets.iter_mut().enumerate() {
                *bucket = Bucket::new(inner.last_update_millis + (i as u64 + 1) * bucket_millis);
            }
            inner.current_index = self.bucket_count - 1;
        } else {
            for i in 0..steps {
                inner.current_index = (inner.current_index + 1) % self.bucket_count;
                let ts = inner.last_update_millis + (i + 1) * bucket_millis;
                inner.buckets[inner.current_index] = Bucket::new(ts);
            }
        }
        inner.last_update_millis = now_millis;
    }

    pub fn add_request(&self, success: bool, latency: Duration) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        self.rotate_locked(&mut inner, now);
        let idx = inner.current_index;
        inner.buckets[idx].fold(success, latency);
    }

    pub fn statistics(&self) -> WindowStatistics {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        self.rotate_locked(&mut inner, now);
        let cutoff = now.saturating_sub(self.window_size.as_millis() as u64);

        let mut requests = 0u64;
        let mut successes = 0u64;
        let mut failures = 0u64;
        let mut latency_sum = Duration::ZERO;
        let mut latency_count = 0u64;

        for bucket in inner.buckets.iter() {
            if bucket.timestamp_millis >= cutoff {
                requests += bucket.requests;
                successes += bucket.successes;
                failures += bucket.failures;
                latency_sum += bucket.latency_sum;
                latency_count += bucket.latency_count;
            }
        }

        let failure_rate = if requests > 0 { failures as f64 / requests as f64 } else { 0.0 };
        let avg_latency = if latency_count > 0 {
            latency_sum / latency_count as u32
        } else {
            Duration::ZERO
        };

        WindowStatistics { requests, successes, failures, failure_rate, avg_latency }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn accumulates_within_a_single_bucket() {
        let clock = ManualClock::new();
        let window = SlidingWindow::new(Duration::from_secs(10), Duration::from_secs(1), clock.clone());
        window.add_request(true, Duration::from_millis(10));
        window.add_request(false, Duration::from_millis(20));
        let stats = window.statistics();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.failure_rate, 0.5);
    }

    #[test]
    fn rotation_drops_stale_buckets_out_of_window() {
        let clock = ManualClock::new();
        let window = SlidingWindow::new(Duration::from_millis(30), Duration::from_millis(10), clock.clone());
        window.add_request(true, Duration::from_millis(1));
        clock.advance(Duration::from_millis(100));
        let stats = window.statistics();
        assert_eq!(stats.requests, 0);
    }

    #[test]
    fn sample_count_matches_window_bound() {
        let clock = ManualClock::new();
        let window = SlidingWindow::new(Duration::from_millis(50), Duration::from_millis(10), clock.clone());
        window.add_request(true, Duration::from_millis(1));
        clock.advance(Duration::from_millis(10));
        window.add_request(true, Duration::from_millis(1));
        clock.advance(Duration::from_millis(10));
        window.add_request(true, Duration::from_millis(1));
        let stats = window.statistics();
        assert_eq!(stats.requests, 3);
    }
}
