//! Self-tuning failure threshold driven by a recent-performance trend
//! (spec §4.D).

use crate::clock::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HISTORY_CAP: usize = 100;

struct Inner {
    current: f64,
    performance_history: VecDeque<f64>,
    last_adjustment_millis: Option<u64>,
}

pub struct AdaptiveThreshold {
    base: f64,
    multiplier: f64,
    adjust_every: Duration,
    min_factor: f64,
    max_factor: f64,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl AdaptiveThreshold {
    pub fn new(base: f64, multiplier: f64, adjust_every: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_factors(base, multiplier, adjust_every, 0.5, 2.0, clock)
    }

    pub fn with_factors(
        base: f64,
        multiplier: f64,
        adjust_every: Duration,
        min_factor: f64,
        max_factor: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            base,
            multiplier,
            adjust_every,
            min_factor,
            max_factor,
            clock,
            inner: Mutex::new(Inner {
                current: base,
                performance_history: VecDeque::with_capacity(HISTORY_CAP),
                last_adjustment_millis: None,
            }),
        }
    }

    pub fn current(&self) -> f64 {
        self.inner.lock().unwrap().current
    }

    /// Feeds a new performance sample and returns the (possibly updated)
    /// threshold. Mirrors the spec's `AdjustThreshold(perf)`.
    pub fn adjust(&self, perf: f64) -> f64 {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();

        if let Some(last) = inner.last_adjustment_millis {
            if now.saturating_sub(last) < self.adjust_every.as_millis() as u64 {
                return inner.current;
            }
        }

        if inner.performance_history.len() == HISTORY_CAP {
            inner.performance_history.pop_front();
        }
        inner.performance_history.push_back(perf);

        let trend = if inner.performance_history.len() >= 10 {
            let n = inner.performance_history.len();
            let last5: f64 = inner.performance_history.iter().skip(n - 5).sum::<f64>() / 5.0;
            let prev5: f64 = inner.performance_history.iter().skip(n - 10).take(5).sum::<f64>() / 5.0;
            if prev5 != 0.0 { (last5 - prev5) / prev5 } else { 0.0 }
        } else {
            0.0
        };

        if trend > 0.1 {
            inner.current *= 1.0 + 0.1 * self.multiplier;
        } else if trend < -0.1 {
            inner.current *= 1.0 - 0.1 * self.multiplier;
        }

        let lo = self.base * self.min_factor;
        let hi = self.base * self.max_factor;
        inner.current = inner.current.clamp(lo, hi);
        inner.last_adjustment_millis = Some(now);
        inner.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn returns_current_before_interval_elapses() {
        let clock = ManualClock::new();
        let threshold = AdaptiveThreshold::new(10.0, 1.0, Duration::from_secs(120), clock.clone());
        let first = threshold.adjust(0.5);
        let second = threshold.adjust(100.0);
        assert_eq!(first, second);
    }

    #[test]
    fn clamps_to_base_factor_bounds() {
        let clock = ManualClock::new();
        let threshold = AdaptiveThreshold::with_factors(
            10.0, 5.0, Duration::from_secs(0), 0.5, 2.0, clock.clone(),
        );
        for i in 0..20 {
            clock.advance(Duration::from_secs(1));
            threshold.adjust(100.0 + i as f64);
        }
        assert!(threshold.current() <= 20.0);
        assert!(threshold.current() >= 5.0);
    }
}
