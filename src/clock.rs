//! Injectable time and randomness (spec §4.A). Every timing-sensitive
//! component takes `Arc<dyn Clock>` / `Arc<dyn Rng>` at construction instead
//! of reaching for `Instant::now()` or `rand::thread_rng()` directly, so
//! tests can advance time and fix randomness deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time, in milliseconds since an arbitrary epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// A source of uniform randomness in `[0, 1)`.
pub trait Rng: Send + Sync + std::fmt::Debug {
    fn float64(&self) -> f64;

    /// Uniform value in `[lo, hi)`, built on [`Rng::float64`].
    fn gen_range(&self, lo: f64, hi: f64) -> f64 {
        lo + self.float64() * (hi - lo)
    }
}

/// Wall-clock `Clock` backed by `Instant`, counted from construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// `Rng` backed by the thread-local CSPRNG.
#[derive(Debug, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn float64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Deterministic clock for tests: starts at zero, advances only when told.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { millis: AtomicU64::new(0) })
    }

    pub fn advance(&self, delta: Duration) {
        self.millis.fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Deterministic `Rng` for tests: returns a fixed, settable value.
#[derive(Debug)]
pub struct FakeRng {
    value: AtomicU64,
}

impl FakeRng {
    /// `value` must be in `[0, 1)`; stored as bits for atomic access.
    pub fn new(value: f64) -> Arc<Self> {
        Arc::new(Self { value: AtomicU64::new(value.to_bits()) })
    }

    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::SeqCst);
    }
}

impl Rng for FakeRng {
    fn float64(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::SeqCst))
    }
}
