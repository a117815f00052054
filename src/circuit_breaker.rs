//! Circuit breaker state machine (spec §4.G). The atomic CAS state-machine
//! core — state stored as an `AtomicU8`, transitions attempted via
//! `compare_exchange`, half-open probes bounded by an atomic counter — is
//! kept in spirit from the teacher's 3-state breaker; this crate
//! generalizes it to 5 states (`ForceOpen`/`ForceClosed` added) and wires
//! in the sliding window, latency detector, health scorer, and adaptive
//! threshold that feed it.

use crate::adaptive_threshold::AdaptiveThreshold;
use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::RelayError;
use crate::health::{HealthInputs, HealthScorer};
use crate::latency_detector::LatencyDetector;
use crate::sliding_window::SlidingWindow;
use crate::timeout::TimeoutPolicy;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;
const STATE_FORCE_OPEN: u8 = 3;
const STATE_FORCE_CLOSED: u8 = 4;

/// Health score below which the 30s health-check worker logs a warning.
/// Not one of `BreakerConfig`'s tunables — spec §6 doesn't enumerate a
/// `healthThreshold` field, so this stays a log-only constant.
const HEALTH_LOG_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    ForceOpen,
    ForceClosed,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            STATE_FORCE_OPEN => CircuitState::ForceOpen,
            _ => CircuitState::ForceClosed,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
            CircuitState::ForceOpen => STATE_FORCE_OPEN,
            CircuitState::ForceClosed => STATE_FORCE_CLOSED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Latency,
    Resource,
    Error,
    Circuit,
}

fn classify(err: &RelayError, duration: Duration, config: &BreakerConfig) -> FailureKind {
    match err {
        RelayError::Timeout { .. } => FailureKind::Timeout,
        RelayError::Resource { .. } => FailureKind::Resource,
        _ if duration >= config.latency_threshold => FailureKind::Latency,
        _ => FailureKind::Error,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: usize,
    pub state_changes: u64,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub health_score: Option<f64>,
}

type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(FailureKind) + Send + Sync>;
type RecoveryCallback = Arc<dyn Fn() + Send + Sync>;

pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    consecutive_successes: AtomicUsize,
    state_changed_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    state_changes: AtomicU64,
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    window: SlidingWindow,
    latency_detector: LatencyDetector,
    latency_history: Mutex<VecDeque<Duration>>,
    percentiles: Mutex<(Duration, Duration, Duration)>,
    health_scorer: HealthScorer,
    adaptive_threshold: Option<AdaptiveThreshold>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    on_state_change: Mutex<Option<StateChangeCallback>>,
    on_failure: Mutex<Option<FailureCallback>>,
    on_recovery: Mutex<Option<RecoveryCallback>>,
}

const LATENCY_HISTORY_CAP: usize = 1000;

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        let adaptive_threshold = if config.enable_health_scoring {
            Some(AdaptiveThreshold::new(
                config.max_failures as f64,
                1.0,
                Duration::from_secs(120),
                clock.clone(),
            ))
        } else {
            None
        };
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        Self {
            window: SlidingWindow::new(Duration::from_secs(60), Duration::from_secs(5), clock.clone()),
            latency_detector: LatencyDetector::with_default_window(clock.clone()),
            latency_history: Mutex::new(VecDeque::with_capacity(LATENCY_HISTORY_CAP)),
            percentiles: Mutex::new((Duration::ZERO, Duration::ZERO, Duration::ZERO)),
            health_scorer: HealthScorer::default(),
            adaptive_threshold,
            config,
            clock,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
            state_changed_at_millis: AtomicU64::new(now),
            half_open_calls: AtomicUsize::new(0),
            state_changes: AtomicU64::new(0),
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            shutdown_tx,
            on_state_change: Mutex::new(None),
            on_failure: Mutex::new(None),
            on_recovery: Mutex::new(None),
        }
    }

    pub fn on_state_change<F: Fn(CircuitState, CircuitState) + Send + Sync + 'static>(&self, f: F) {
        *self.on_state_change.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_failure<F: Fn(FailureKind) + Send + Sync + 'static>(&self, f: F) {
        *self.on_failure.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn on_recovery<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self.on_recovery.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn try_transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let ok = self
            .state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            self.state_changed_at_millis.store(self.clock.now_millis(), Ordering::SeqCst);
            self.state_changes.fetch_add(1, Ordering::SeqCst);
            if let Some(cb) = self.on_state_change.lock().unwrap().clone() {
                tokio::spawn(async move { cb(from, to) });
            }
        }
        ok
    }

    /// `Allow() -> bool`. Lazily promotes Open → HalfOpen once
    /// `resetTimeout` elapses, then bounds concurrent probes.
    pub fn allow(&self) -> bool {
        loop {
            match self.state() {
                CircuitState::ForceOpen => return false,
                CircuitState::ForceClosed | CircuitState::Closed => return true,
                CircuitState::Open => {
                    let now = self.clock.now_millis();
                    let changed_at = self.state_changed_at_millis.load(Ordering::SeqCst);
                    if now.saturating_sub(changed_at) >= self.config.reset_timeout.as_millis() as u64 {
                        if self.try_transition(CircuitState::Open, CircuitState::HalfOpen) {
                            self.half_open_calls.store(0, Ordering::SeqCst);
                            self.consecutive_successes.store(0, Ordering::SeqCst);
                        }
                        continue;
                    }
                    return false;
                }
                CircuitState::HalfOpen => {
                    let mut current = self.half_open_calls.load(Ordering::SeqCst);
                    loop {
                        if current >= self.config.half_open_max_calls {
                            return false;
                        }
                        match self.half_open_calls.compare_exchange(
                            current,
                            current + 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(_) => return true,
                            Err(actual) => current = actual,
                        }
                    }
                }
            }
        }
    }

    pub fn force_open(&self) {
        self.state.store(STATE_FORCE_OPEN, Ordering::SeqCst);
        self.state_changed_at_millis.store(self.clock.now_millis(), Ordering::SeqCst);
    }

    pub fn force_closed(&self) {
        self.state.store(STATE_FORCE_CLOSED, Ordering::SeqCst);
        self.state_changed_at_millis.store(self.clock.now_millis(), Ordering::SeqCst);
    }

    /// Returns to `Closed` unconditionally and clears all counters; the
    /// only way out of `ForceOpen`/`ForceClosed` (spec §3 invariant).
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.state_changed_at_millis.store(self.clock.now_millis(), Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.half_open_calls.store(0, Ordering::SeqCst);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn effective_failure_threshold(&self) -> usize {
        match &self.adaptive_threshold {
            Some(t) => t.current().round().max(1.0) as usize,
            None => self.config.max_failures,
        }
    }

    fn record_latency(&self, duration: Duration) {
        let mut history = self.latency_history.lock().unwrap();
        if history.len() >= LATENCY_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(duration);
        let mut sorted: Vec<Duration> = history.iter().copied().collect();
        sorted.sort();
        let pick = |q: f64| -> Duration {
            if sorted.is_empty() {
                return Duration::ZERO;
            }
            let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        *self.percentiles.lock().unwrap() = (pick(0.50), pick(0.95), pick(0.99));
        self.latency_detector.add_latency(duration);
    }

    fn on_success(&self, duration: Duration) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.window.add_request(true, duration);
        self.record_latency(duration);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
            self.consecutive_failures.store(0, Ordering::SeqCst);
            if successes >= self.config.half_open_max_calls
                && self.try_transition(CircuitState::HalfOpen, CircuitState::Closed)
            {
                self.consecutive_successes.store(0, Ordering::SeqCst);
                self.half_open_calls.store(0, Ordering::SeqCst);
                if let Some(cb) = self.on_recovery.lock().unwrap().clone() {
                    tokio::spawn(async move { cb() });
                }
            }
        } else {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
    }

    fn on_failure(&self, kind: FailureKind, duration: Duration) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.window.add_request(false, duration);
        self.record_latency(duration);

        match self.state() {
            CircuitState::HalfOpen => {
                if self.try_transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.half_open_calls.store(0, Ordering::SeqCst);
                    if let Some(cb) = self.on_failure.lock().unwrap().clone() {
                        tokio::spawn(async move { cb(kind) });
                    }
                }
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.consecutive_successes.store(0, Ordering::SeqCst);
                if failures >= self.effective_failure_threshold()
                    && self.try_transition(CircuitState::Closed, CircuitState::Open)
                {
                    if let Some(cb) = self.on_failure.lock().unwrap().clone() {
                        tokio::spawn(async move { cb(kind) });
                    }
                }
            }
            _ => {}
        }
    }

    /// `Execute(ctx, f) -> Result`. Wraps `operation` with a per-call
    /// timeout; if `Allow` denies, a synthetic `Circuit` failure is
    /// recorded and `CircuitOpen` is returned without invoking `operation`.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RelayError>
    where
        T: Send,
        Fut: Future<Output = Result<T, RelayError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if !self.allow() {
            let failure_count = self.consecutive_failures.load(Ordering::SeqCst);
            let changed_at = self.state_changed_at_millis.load(Ordering::SeqCst);
            let open_duration =
                Duration::from_millis(self.clock.now_millis().saturating_sub(changed_at));
            return Err(RelayError::CircuitOpen { failure_count, open_duration });
        }

        let timeout = TimeoutPolicy::new(self.config.call_timeout)
            .expect("call_timeout validated at breaker construction");
        let start = self.clock.now_millis();
        let result = timeout.execute(operation).await;
        let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(start));

        match &result {
            Ok(_) => self.on_success(elapsed),
            Err(err) => self.on_failure(classify(err, elapsed, &self.config), elapsed),
        }
        result
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let (p50, p95, p99) = *self.percentiles.lock().unwrap();
        let health_score = if self.config.enable_health_scoring {
            let stats = self.window.statistics();
            Some(self.health_scorer.score(HealthInputs {
                success_rate: 1.0 - stats.failure_rate,
                latency_ms: stats.avg_latency.as_secs_f64() * 1000.0,
                p50_target_ms: 50.0,
                max_target_ms: 1000.0,
                error_rate: stats.failure_rate,
                utilization: 0.0,
                throughput: stats.requests as f64,
                target_tps: 100.0,
            }))
        } else {
            None
        };
        BreakerMetrics {
            state: self.state(),
            total: self.total.load(Ordering::SeqCst),
            successes: self.successes.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            state_changes: self.state_changes.load(Ordering::SeqCst),
            p50,
            p95,
            p99,
            health_score,
        }
    }

    /// Spawns the background workers spec §4.G calls for (metrics
    /// aggregation every minute, health check every 30s, adaptive
    /// threshold tuning every 2 minutes). The caller (supervisor) owns the
    /// returned handles and the shutdown broadcast that stops them —
    /// nothing is spawned by `new`.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let breaker = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let m = breaker.metrics();
                        tracing::debug!(state = ?m.state, total = m.total, "breaker metrics aggregated");
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        let breaker = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Some(score) = breaker.metrics().health_score {
                            if score < HEALTH_LOG_THRESHOLD {
                                tracing::warn!(score, "breaker health degraded");
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        if self.adaptive_threshold.is_some() {
            let breaker = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(120));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let stats = breaker.window.statistics();
                            if let Some(threshold) = &breaker.adaptive_threshold {
                                let perf = 1.0 - stats.failure_rate;
                                threshold.adjust(perf);
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_failures: 3,
            reset_timeout: Duration::from_millis(100),
            half_open_max_calls: 2,
            enable_health_scoring: false,
            ..BreakerConfig::default()
        }
    }

    #[tokio::test]
    async fn trips_after_threshold_failures_then_recovers() {
        let clock = ManualClock::new();
        let breaker = Arc::new(CircuitBreaker::new(config(), clock.clone()));

        for _ in 0..3 {
            let result = breaker.execute(|| async { Err::<(), _>(RelayError::Internal { reason: "boom".into() }) }).await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let denied = breaker.execute(|| async { Ok::<_, RelayError>(()) }).await;
        assert!(matches!(denied.unwrap_err(), RelayError::CircuitOpen { .. }));

        clock.advance(Duration::from_millis(150));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.execute(|| async { Ok::<_, RelayError>(()) }).await.unwrap();
        breaker.execute(|| async { Ok::<_, RelayError>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.metrics().state_changes >= 2);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let clock = ManualClock::new();
        let breaker = Arc::new(CircuitBreaker::new(config(), clock.clone()));
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(RelayError::Internal { reason: "x".into() }) }).await;
        }
        clock.advance(Duration::from_millis(150));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = breaker.execute(|| async { Err::<(), _>(RelayError::Internal { reason: "x".into() }) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn force_states_bypass_logic_until_reset() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(config(), clock);
        breaker.force_open();
        assert!(!breaker.allow());
        breaker.force_closed();
        assert!(breaker.allow());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_bounds_concurrent_probes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(config(), clock.clone());
        for _ in 0..3 {
            let _ = breaker.execute(|| async { Err::<(), _>(RelayError::Internal { reason: "x".into() }) }).await;
        }
        clock.advance(Duration::from_millis(150));
        assert!(breaker.allow());
        assert!(breaker.allow());
        assert!(!breaker.allow());
    }
}
