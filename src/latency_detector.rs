//! Detects sustained tail-latency regression (spec §4.E).

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CAP: usize = 1000;

struct Sample {
    at_millis: u64,
    latency: Duration,
}

struct Inner {
    samples: VecDeque<Sample>,
}

pub struct LatencyDetector {
    detection_window: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl LatencyDetector {
    pub fn new(detection_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { detection_window, clock, inner: Mutex::new(Inner { samples: VecDeque::new() }) }
    }

    pub fn with_default_window(clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::from_secs(5 * 60), clock)
    }

    pub fn add_latency(&self, latency: Duration) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();
        inner.samples.push_back(Sample { at_millis: now, latency });
        let cutoff = now.saturating_sub(self.detection_window.as_millis() as u64);
        while let Some(front) = inner.samples.front() {
            if front.at_millis < cutoff {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
        while inner.samples.len() > CAP {
            inner.samples.pop_front();
        }
    }

    /// Signals degradation iff the latency just observed exceeds
    /// `baseline * multiplier` AND at least 10 samples exist AND more than
    /// 70% of the last 10 samples exceed the same threshold.
    pub fn is_degraded(&self, baseline: Duration, multiplier: f64) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.samples.len() < 10 {
            return false;
        }
        let threshold = baseline.mul_f64(multiplier);
        let last10: Vec<&Sample> = inner.samples.iter().rev().take(10).collect();
        let exceeding = last10.iter().filter(|s| s.latency > threshold).count();
        exceeding as f64 / 10.0 > 0.7
    }
}
