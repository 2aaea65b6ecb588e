//! Egress Rotator Crate
//!
//! This crate picks an outbound endpoint (typically a forward proxy) from a
//! pool for every request, and keeps requests flowing when endpoints fail.
//!
//! # Overview
//!
//! The rotator supports:
//! - Pluggable rotation strategies resolved by name from a registry
//! - A per-endpoint circuit breaker that isolates failing endpoints
//! - Retries with exponential, linear or fixed backoff and jitter
//! - Failover to the best untried endpoint on retryable failures
//! - Retry metrics with hourly rollups
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+
//! |     Caller       | --> |     Rotator      |  (select -> attempt -> retry)
//! +------------------+     +------------------+
//!                             |            |
//!                             v            v
//!                  +----------------+  +------------------+
//!                  |  EndpointPool  |  | CircuitBreakers  |  (per endpoint)
//!                  +----------------+  +------------------+
//!                             |            |
//!                             v            v
//!                          +------------------+
//!                          | RotationStrategy |  (from StrategyRegistry)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |    Transport     |  (reqwest through the proxy)
//!                          +------------------+
//!                                  |
//!                                  v
//!                          +------------------+
//!                          |  RetryMetrics    |  (attempts, rollups)
//!                          +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`Rotator`] - Orchestrates selection, execution and retries
//! - [`Endpoint`] - Pool member with identity, tags and live statistics
//! - [`SelectionContext`] - Per-request hints (session, region, tried ids)
//! - [`RetryPolicy`] - How many attempts, how long to wait between them
//! - [`CircuitBreaker`] - Three-state failure isolation for one endpoint
//! - [`RotatorError`] - Terminal outcome of a request

pub mod circuit;
pub mod engine;
pub mod errors;
pub mod models;
pub mod pool;
pub mod retry;
pub mod strategy;
pub mod transport;

mod sync;

// Re-export the orchestrator
pub use engine::{Execution, PersistenceConfig, Rotator, RotatorBuilder, RotatorConfig};

// Re-export error types
pub use errors::{AttemptFailure, RetryClass, RotatorError, TransportError, TransportErrorKind};

// Re-export models
pub use models::{
    Endpoint, EndpointId, EndpointSnapshot, HealthStatus, HttpMethod, ProxyRequest,
    ProxyResponse, SelectionContext,
};

pub use pool::{EndpointPool, PoolSnapshot};

// Re-export circuit breaker types
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot, CircuitState,
    CircuitStateStore, CircuitTransition, MemoryCircuitStore, TransitionSink,
};

// Re-export retry types
pub use retry::{BackoffStrategy, RetryMetrics, RetryMetricsSummary, RetryPolicy};

// Re-export strategy types
pub use strategy::{RotationStrategy, StrategyConfig, StrategyRegistry};

pub use transport::{ReqwestTransport, Transport};

/// Result type alias for rotator operations.
pub type Result<T> = std::result::Result<T, RotatorError>;
