//! Jitter applied to backoff delays (spec §4.C). Only the jitter
//! modes the spec defines are kept; jitter never mutates the delay it's
//! computed from, only the value returned to the caller.

use crate::clock::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing a backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter: return the delay unchanged.
    None,
    /// Full jitter: uniform in `[0, d)`.
    Full,
    /// Equal jitter: uniform in `[0.5d, 1.5d)`.
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration, rng: &dyn Rng) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let d = delay.as_secs_f64();
                Duration::from_secs_f64(rng.gen_range(0.0, d))
            }
            Jitter::Equal => {
                let d = delay.as_secs_f64();
                let factor = 0.5 + rng.float64();
                Duration::from_secs_f64(factor * d)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let rng = FakeRng::new(0.9);
        let delay = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply(delay, &*rng), delay);
    }

    #[test]
    fn full_jitter_is_in_zero_to_delay() {
        let delay = Duration::from_millis(1000);
        for bits in [0.0, 0.25, 0.5, 0.75, 0.999] {
            let rng = FakeRng::new(bits);
            let jittered = Jitter::Full.apply(delay, &*rng);
            assert!(jittered < delay || bits == 0.0);
            assert!(jittered.as_secs_f64() >= 0.0);
        }
    }

    #[test]
    fn equal_jitter_is_in_half_to_one_half_delay() {
        let delay = Duration::from_millis(1000);
        let low = FakeRng::new(0.0);
        let high = FakeRng::new(0.999);
        let jittered_low = Jitter::Equal.apply(delay, &*low);
        let jittered_high = Jitter::Equal.apply(delay, &*high);
        assert_eq!(jittered_low, Duration::from_millis(500));
        assert!(jittered_high.as_millis() < 1500 && jittered_high.as_millis() >= 1499);
    }

    #[test]
    fn jitter_handles_zero_delay() {
        let rng = FakeRng::new(0.5);
        assert_eq!(Jitter::Full.apply(Duration::ZERO, &*rng), Duration::ZERO);
        assert_eq!(Jitter::Equal.apply(Duration::ZERO, &*rng), Duration::ZERO);
    }
}
