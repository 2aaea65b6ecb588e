//! Retry policy, backoff, failover scoring and retry metrics.
//!
//! Failure classification lives with the error types
//! ([`AttemptFailure::retry_class`](crate::errors::AttemptFailure::retry_class));
//! this module decides how long to wait and where to go next.

mod backoff;
mod failover;
mod metrics;
mod policy;

pub use backoff::{apply_jitter, JITTER_MAX, JITTER_MIN};
pub use failover::{failover_score, select_failover};
pub use metrics::{
    AttemptOutcome, EndpointRetryStats, HourlyRollup, MetricsConfig, MetricsSink, RetryAttempt,
    RetryMetrics, RetryMetricsSummary,
};
pub use policy::{BackoffStrategy, FailoverScoring, RetryPolicy, MAX_ATTEMPTS, MIN_ATTEMPTS};
