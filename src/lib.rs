#![forbid(unsafe_code)]

//! # relay-core
//!
//! Core cache, circuit-breaker, throttle, and fan-out engine shared across
//! a multi-tenant, multi-chain blockchain relay. This crate owns the
//! in-process resilience and hot-path infrastructure; HTTP/WebSocket
//! transport, chain-specific block parsing, and on-chain submission are
//! external collaborators this crate only exposes narrow capability
//! interfaces toward.
//!
//! ## Components
//!
//! - [`cache`] — tiered cache facade with TinyLFU admission, single-flight
//!   coalescing, and stale-while-revalidate.
//! - [`circuit_breaker`] / [`circuit_breaker_registry`] — a five-state
//!   circuit breaker and its per-endpoint registry.
//! - [`throttle`] — endpoint health tracking, backoff, and scoring.
//! - [`broadcast`] — fan-out of block events to per-tier subscribers.
//! - [`tier`] — static tier policy and token-bucket rate limiting.
//! - [`ingestion`] — chain adapter contract, mock adapter, reconnect loop.
//! - [`supervisor`] — wires every component and owns startup/shutdown.
//!
//! ## Quick Start
//!
//! ```rust
//! use relay_core::{Supervisor, SupervisorConfig, SystemClock, TokioSleeper};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let clock = Arc::new(SystemClock::new());
//!     let supervisor = Supervisor::new(SupervisorConfig::default(), clock, Vec::new());
//!     supervisor.start(Arc::new(TokioSleeper));
//!     supervisor.shutdown().await.expect("shutdown within deadline");
//! }
//! ```

mod adaptive;
mod adaptive_threshold;
mod backoff;
mod broadcast;
mod cache;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod error;
mod health;
mod ingestion;
mod jitter;
mod latency_detector;
mod lru;
mod metrics;
mod model;
mod rate_limit;
mod sleeper;
mod sliding_window;
mod supervisor;
mod telemetry;
mod throttle;
mod tier;
mod timeout;
mod tinylfu;

pub use broadcast::{BroadcastHub, BroadcastMetrics, Subscription};
pub use cache::{CacheMetrics, EnterpriseCache};
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitState, FailureKind};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use backoff::ExponentialBackoff;
pub use clock::{Clock, FakeRng, ManualClock, Rng, SystemClock, SystemRng};
pub use jitter::Jitter;
pub use config::{BreakerConfig, CacheConfig, CompressionType, EvictionStrategy, ThrottleConfig, TierEntry, TierTable};
pub use error::RelayError;
pub use ingestion::{run_with_reconnect, ChainAdapter, MockAdapter};
pub use model::{BlockEvent, Chain, EndpointStatus, Tier};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use telemetry::{
    BreakerEvent, BroadcastEvent, CacheEvent, FallbackSink, LogSink, MemorySink, MulticastSink, NullSink, RelayEvent,
    StreamingSink, TelemetrySink, ThrottleEvent,
};
pub use throttle::{EndpointThrottle, ScoringConfig};
pub use tier::TierPolicy;

#[cfg(feature = "metrics")]
pub use metrics::PrometheusSink;

pub mod prelude;
