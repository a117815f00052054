//! Error taxonomy for the relay core (spec §7).

use std::time::Duration;
use thiserror::Error;

/// The discriminated error kind every fallible core operation returns.
///
/// `NotFound` is a sentinel the cache façade treats specially: it triggers
/// negative caching in `GetSWR` rather than propagating as a hard failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayError {
    #[error("key not found")]
    NotFound,

    #[error("operation timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    #[error("latency {observed:?} exceeded threshold {threshold:?}")]
    Latency { observed: Duration, threshold: Duration },

    #[error("resource exhausted: {reason}")]
    Resource { reason: String },

    #[error("circuit open ({failure_count} failures, open for {open_duration:?})")]
    CircuitOpen { failure_count: usize, open_duration: Duration },

    #[error("operation canceled")]
    Canceled,

    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Errors raised by a fallible constructor validating its configuration
/// (e.g. a zero or out-of-range duration), instead of panicking.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be > 0, got {value:?}")]
    ZeroDuration { field: &'static str, value: Duration },

    #[error("{field} exceeds maximum {limit:?}, got {value:?}")]
    ExceedsMaximum { field: &'static str, value: Duration, limit: Duration },

    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        assert!(RelayError::NotFound.is_not_found());
        assert!(!RelayError::Canceled.is_not_found());
    }

    #[test]
    fn circuit_open_display_includes_counts() {
        let err = RelayError::CircuitOpen {
            failure_count: 5,
            open_duration: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains("30s"));
    }

    #[test]
    fn config_error_out_of_range_display() {
        let err = ConfigError::OutOfRange { field: "successThreshold", value: 1.5, min: 0.0, max: 1.0 };
        assert!(err.to_string().contains("successThreshold"));
    }
}
