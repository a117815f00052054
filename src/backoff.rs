//! Stateful exponential backoff (spec §4.C). Unlike a pure
//! `attempt -> delay` function, this tracks `delayBase`/`attempt` across
//! calls so a caller can repeatedly ask "what's next" without re-deriving
//! attempt count itself — the shape the endpoint throttle (§4.H) and
//! circuit breaker recovery logic need.

use crate::clock::Rng;
use crate::jitter::Jitter;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct BackoffState {
    delay_base: Duration,
    attempt: u64,
}

pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Jitter,
    rng: Arc<dyn Rng>,
    state: Mutex<BackoffState>,
}

impl ExponentialBackoff {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: Jitter,
        rng: Arc<dyn Rng>,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter,
            rng,
            state: Mutex::new(BackoffState { delay_base: base_delay, attempt: 0 }),
        }
    }

    /// Returns the next jittered delay, advancing internal state. `delayBase`
    /// itself is never jittered — only the value handed back to the caller.
    pub fn next_delay(&self) -> Duration {
        let mut state = self.state.lock().unwrap();
        if state.attempt > 0 {
            let scaled = state.delay_base.mul_f64(self.multiplier);
            state.delay_base = scaled.min(self.max_delay);
        }
        state.attempt += 1;
        let base = state.delay_base;
        drop(state);
        self.jitter.apply(base, &*self.rng)
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.delay_base = self.base_delay;
        state.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeRng;

    #[test]
    fn doubles_up_to_max_with_no_jitter() {
        let rng = FakeRng::new(0.0);
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(160),
            2.0,
            Jitter::None,
            rng,
        );
        let expected = [10, 20, 40, 80, 160];
        for ms in expected {
            assert_eq!(backoff.next_delay(), Duration::from_millis(ms));
        }
    }

    #[test]
    fn full_jitter_stays_within_bounds_across_calls() {
        let rng = FakeRng::new(0.5);
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(160),
            2.0,
            Jitter::Full,
            rng,
        );
        let bounds = [10u64, 20, 40, 80, 160];
        for bound in bounds {
            let d = backoff.next_delay();
            assert!(d.as_millis() < bound as u128 || bound == 10 && d.as_millis() <= 10);
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        let rng = FakeRng::new(0.0);
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(160),
            2.0,
            Jitter::None,
            rng,
        );
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
