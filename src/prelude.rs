//! Convenient re-exports for common `relay-core` types.
pub use crate::{
    BlockEvent, BreakerConfig, BreakerEvent, BroadcastEvent, BroadcastHub, CacheConfig, CacheEvent, Chain,
    CircuitBreaker, CircuitBreakerRegistry, CircuitState, Clock, EndpointStatus, EndpointThrottle, EnterpriseCache,
    FailureKind, NullSink, RelayError, RelayEvent, Rng, Sleeper, Supervisor, SupervisorConfig, SystemClock, SystemRng,
    ThrottleConfig, ThrottleEvent, Tier, TierEntry, TierPolicy, TierTable, TokioSleeper,
};
