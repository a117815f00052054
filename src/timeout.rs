//! Per-call timeout enforcement, used by the circuit breaker's `Execute`
//! (spec §4.G: "Execute wraps f with a per-call timeout derived from
//! config; if f exceeds it, the result is marked Timeout and f's return is
//! ignored").
//!
//! On timeout the inner future is dropped (not forcibly aborted) — Tokio
//! has no preemption, so cancellation-unsafe work may leave partial state.
//! `elapsed` is measured from just before invoking the operation and can
//! exceed the configured duration slightly due to scheduling overhead.

use crate::error::{ConfigError, RelayError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout duration (30 days), guarding against accidental
/// `Duration::MAX`-style misconfiguration while permitting long jobs.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "timeout", value: duration });
        }
        if duration > max {
            return Err(ConfigError::ExceedsMaximum { field: "timeout", value: duration, limit: max });
        }
        Ok(Self { duration })
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, RelayError>
    where
        T: Send,
        Fut: Future<Output = Result<T, RelayError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                Err(RelayError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();
        let result = timeout.execute(|| async { Ok::<_, RelayError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn times_out_long_operation() {
        tokio::time::pause();
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let fut = timeout.execute(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, RelayError>(())
        });
        tokio::pin!(fut);
        tokio::time::advance(Duration::from_millis(51)).await;
        let result = fut.await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();
        let result = timeout.execute(|| async { Err::<(), _>(RelayError::NotFound) }).await;
        assert!(matches!(result.unwrap_err(), RelayError::NotFound));
    }

    #[test]
    fn rejects_zero_duration() {
        let err = TimeoutPolicy::new(Duration::ZERO).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration { .. }));
    }

    #[test]
    fn rejects_excessive_duration() {
        let too_big = MAX_TIMEOUT + Duration::from_secs(1);
        let err = TimeoutPolicy::new(too_big).unwrap_err();
        assert!(matches!(err, ConfigError::ExceedsMaximum { .. }));
    }
}
