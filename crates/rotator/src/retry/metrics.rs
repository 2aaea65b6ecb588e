//! Retry metrics: per-attempt records, hourly rollups and circuit
//! transitions.
//!
//! Everything here is derived data. Recording never fails and never blocks
//! for longer than a short critical section; losing metrics does not affect
//! selection or retries.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit::{CircuitTransition, TransitionSink};
use crate::errors::{AttemptFailure, RotatorError};
use crate::models::EndpointId;
use crate::sync::lock;
use crate::Result;

const DEFAULT_ATTEMPT_RETENTION: Duration = Duration::from_secs(60 * 60);
const DEFAULT_HOURLY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_TRANSITION_CAPACITY: usize = 1000;
const DEFAULT_ROLLUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Retention settings for retry metrics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsConfig {
    /// How long raw attempt records are kept
    #[serde(with = "humantime_serde")]
    pub attempt_retention: Duration,
    /// How long hourly buckets are kept
    #[serde(with = "humantime_serde")]
    pub hourly_retention: Duration,
    /// Circuit transitions kept in the ring buffer
    pub transition_capacity: usize,
    /// Period of the background rollup task
    #[serde(with = "humantime_serde")]
    pub rollup_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            attempt_retention: DEFAULT_ATTEMPT_RETENTION,
            hourly_retention: DEFAULT_HOURLY_RETENTION,
            transition_capacity: DEFAULT_TRANSITION_CAPACITY,
            rollup_interval: DEFAULT_ROLLUP_INTERVAL,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempt_retention.is_zero() || self.hourly_retention.is_zero() {
            return Err(RotatorError::invalid("metrics retention must be positive"));
        }
        if self.rollup_interval.is_zero() {
            return Err(RotatorError::invalid("metrics rollupInterval must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One attempt of one logical request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    pub request_id: Uuid,
    pub endpoint_id: EndpointId,
    /// 1-based
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Failure label (`connect`, `status_503`, ...) for failed attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    pub at: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn success(
        request_id: Uuid,
        endpoint_id: EndpointId,
        attempt_number: u32,
        latency: Duration,
    ) -> Self {
        Self {
            request_id,
            endpoint_id,
            attempt_number,
            outcome: AttemptOutcome::Success,
            failure: None,
            latency,
            at: Utc::now(),
        }
    }

    pub fn failure(
        request_id: Uuid,
        endpoint_id: EndpointId,
        attempt_number: u32,
        failure: &AttemptFailure,
        latency: Duration,
    ) -> Self {
        Self {
            request_id,
            endpoint_id,
            attempt_number,
            outcome: AttemptOutcome::Failure,
            failure: Some(failure.label()),
            latency,
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

#[derive(Clone, Debug)]
struct RequestRecord {
    attempts: u32,
    succeeded: bool,
    at: DateTime<Utc>,
}

/// Aggregated counters for one clock hour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyRollup {
    pub hour: DateTime<Utc>,
    pub requests: u64,
    pub retried_requests: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: f64,
}

impl HourlyRollup {
    fn new(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            ..Default::default()
        }
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.total_latency_ms / self.attempts as f64)
    }

    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }
}

/// Per-endpoint slice of a summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

/// Metrics over a trailing window.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMetricsSummary {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Requests that needed more than one attempt
    pub retried_requests: u64,
    pub total_attempts: u64,
    /// Successful requests / requests
    pub success_rate: f64,
    /// Retried requests / requests
    pub retry_rate: f64,
    pub avg_attempts_per_request: f64,
    pub avg_latency_ms: f64,
    pub endpoints: BTreeMap<String, EndpointRetryStats>,
    pub circuit_transitions: usize,
    pub generated_at: DateTime<Utc>,
}

/// Receives summaries from the background rollup task.
///
/// `publish()` runs on the rollup task and should return quickly.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, summary: &RetryMetricsSummary, hourly: &[HourlyRollup]);
}

#[derive(Default)]
struct MetricsState {
    attempts: VecDeque<RetryAttempt>,
    requests: VecDeque<RequestRecord>,
    /// Leading attempts/requests already folded into `hourly`.
    rolled_attempts: usize,
    rolled_requests: usize,
    hourly: BTreeMap<DateTime<Utc>, HourlyRollup>,
    transitions: VecDeque<CircuitTransition>,
}

impl MetricsState {
    /// Drop raw records stamped before `cutoff`, folding the ones no rollup
    /// has aggregated yet. Returns how many were folded here.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut folded = 0;
        while let Some(attempt) = self.attempts.front() {
            if attempt.at >= cutoff {
                break;
            }
            if self.rolled_attempts == 0 {
                fold_attempt(&mut self.hourly, attempt);
                folded += 1;
            } else {
                self.rolled_attempts -= 1;
            }
            self.attempts.pop_front();
        }

        while let Some(request) = self.requests.front() {
            if request.at >= cutoff {
                break;
            }
            if self.rolled_requests == 0 {
                fold_request(&mut self.hourly, request);
                folded += 1;
            } else {
                self.rolled_requests -= 1;
            }
            self.requests.pop_front();
        }
        folded
    }

    fn prune_hourly(&mut self, cutoff: DateTime<Utc>) {
        let oldest_kept = hour_of(cutoff);
        while let Some(entry) = self.hourly.first_entry() {
            if *entry.key() >= oldest_kept {
                break;
            }
            entry.remove();
        }
    }
}

fn bucket_for(
    hourly: &mut BTreeMap<DateTime<Utc>, HourlyRollup>,
    at: DateTime<Utc>,
) -> &mut HourlyRollup {
    hourly
        .entry(hour_of(at))
        .or_insert_with_key(|hour| HourlyRollup::new(*hour))
}

fn fold_attempt(hourly: &mut BTreeMap<DateTime<Utc>, HourlyRollup>, attempt: &RetryAttempt) {
    let bucket = bucket_for(hourly, attempt.at);
    bucket.attempts += 1;
    if attempt.is_success() {
        bucket.successes += 1;
    } else {
        bucket.failures += 1;
    }
    bucket.total_latency_ms += attempt.latency.as_secs_f64() * 1000.0;
}

fn fold_request(hourly: &mut BTreeMap<DateTime<Utc>, HourlyRollup>, request: &RequestRecord) {
    let bucket = bucket_for(hourly, request.at);
    bucket.requests += 1;
    if request.attempts > 1 {
        bucket.retried_requests += 1;
    }
}

/// Retry metrics store.
pub struct RetryMetrics {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        lock(&self.state, "Retry metrics")
    }

    /// Record one attempt.
    ///
    /// Raw records older than the attempt retention (relative to this
    /// record) are folded into their hourly bucket and dropped here, so
    /// memory stays bounded even when no rollup task runs.
    pub fn record_attempt(&self, attempt: RetryAttempt) {
        let at = attempt.at;
        let mut state = self.state();
        state.attempts.push_back(attempt);
        self.evict_expired(&mut state, at);
    }

    /// Record the end of a logical request.
    pub fn record_request(&self, attempts: u32, succeeded: bool) {
        let at = Utc::now();
        let mut state = self.state();
        state.requests.push_back(RequestRecord {
            attempts,
            succeeded,
            at,
        });
        self.evict_expired(&mut state, at);
    }

    fn evict_expired(&self, state: &mut MetricsState, now: DateTime<Utc>) {
        let folded = state.evict_before(before(now, self.config.attempt_retention));
        if folded > 0 {
            state.prune_hourly(before(now, self.config.hourly_retention));
            debug!("Retry metrics: folded {} expired record(s) without a rollup", folded);
        }
    }

    pub fn record_transition(&self, transition: &CircuitTransition) {
        let capacity = self.config.transition_capacity;
        if capacity == 0 {
            return;
        }
        let mut state = self.state();
        while state.transitions.len() >= capacity {
            state.transitions.pop_front();
        }
        state.transitions.push_back(transition.clone());
    }

    /// Most recent transitions, newest last.
    pub fn recent_transitions(&self, limit: usize) -> Vec<CircuitTransition> {
        let state = self.state();
        let skip = state.transitions.len().saturating_sub(limit);
        state.transitions.iter().skip(skip).cloned().collect()
    }

    /// Fold records not yet aggregated (and not newer than `now`) into
    /// their hourly buckets, then drop data past retention.
    ///
    /// Each record is aggregated exactly once no matter how often this runs.
    /// Returns the number of attempts aggregated.
    pub fn rollup(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state();
        let state = &mut *state;

        let mut aggregated = 0;
        while let Some(attempt) = state.attempts.get(state.rolled_attempts) {
            if attempt.at > now {
                break;
            }
            fold_attempt(&mut state.hourly, attempt);
            state.rolled_attempts += 1;
            aggregated += 1;
        }

        while let Some(request) = state.requests.get(state.rolled_requests) {
            if request.at > now {
                break;
            }
            fold_request(&mut state.hourly, request);
            state.rolled_requests += 1;
        }

        state.evict_before(before(now, self.config.attempt_retention));
        state.prune_hourly(before(now, self.config.hourly_retention));

        debug!(
            "Retry metrics: rolled up {} attempts, {} hourly buckets retained",
            aggregated,
            state.hourly.len()
        );
        aggregated
    }

    /// Hourly buckets, oldest first.
    pub fn hourly_series(&self) -> Vec<HourlyRollup> {
        self.state().hourly.values().cloned().collect()
    }

    /// Summary over the trailing `window` (default and maximum: the attempt
    /// retention).
    pub fn summary(&self, window: Option<Duration>) -> RetryMetricsSummary {
        let window = window
            .unwrap_or(self.config.attempt_retention)
            .min(self.config.attempt_retention);
        let now = Utc::now();
        let since = before(now, window);
        let state = self.state();

        let mut endpoints: BTreeMap<String, EndpointRetryStats> = BTreeMap::new();
        let mut total_attempts = 0u64;
        let mut total_latency_ms = 0.0;
        for attempt in state.attempts.iter().filter(|a| a.at >= since) {
            let latency_ms = attempt.latency.as_secs_f64() * 1000.0;
            total_attempts += 1;
            total_latency_ms += latency_ms;

            let stats = endpoints.entry(attempt.endpoint_id.to_string()).or_default();
            stats.attempts += 1;
            if attempt.is_success() {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            // running mean
            stats.avg_latency_ms += (latency_ms - stats.avg_latency_ms) / stats.attempts as f64;
        }

        let mut total_requests = 0u64;
        let mut successful_requests = 0u64;
        let mut retried_requests = 0u64;
        let mut request_attempts = 0u64;
        for request in state.requests.iter().filter(|r| r.at >= since) {
            total_requests += 1;
            request_attempts += u64::from(request.attempts);
            if request.succeeded {
                successful_requests += 1;
            }
            if request.attempts > 1 {
                retried_requests += 1;
            }
        }

        let circuit_transitions = state
            .transitions
            .iter()
            .filter(|t| t.at >= since)
            .count();

        RetryMetricsSummary {
            window,
            total_requests,
            successful_requests,
            failed_requests: total_requests - successful_requests,
            retried_requests,
            total_attempts,
            success_rate: ratio(successful_requests, total_requests),
            retry_rate: ratio(retried_requests, total_requests),
            avg_attempts_per_request: ratio(request_attempts, total_requests),
            avg_latency_ms: if total_attempts > 0 {
                total_latency_ms / total_attempts as f64
            } else {
                0.0
            },
            endpoints,
            circuit_transitions,
            generated_at: now,
        }
    }

    /// Run `rollup` every `interval` until `cancel` fires, pushing a summary
    /// to `sink` after each run.
    pub fn spawn_rollup_task(
        self: &Arc<Self>,
        interval: Duration,
        sink: Option<Arc<dyn MetricsSink>>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(RotatorError::invalid("rollup interval must be positive"));
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            RotatorError::invalid("metrics rollup requires a running tokio runtime")
        })?;

        let metrics = Arc::clone(self);
        Ok(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        metrics.rollup(Utc::now());
                        if let Some(sink) = &sink {
                            sink.publish(&metrics.summary(None), &metrics.hourly_series());
                        }
                    }
                }
            }
            debug!("Retry metrics: rollup task stopped");
        }))
    }
}

impl Default for RetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionSink for RetryMetrics {
    fn emit(&self, transition: &CircuitTransition) {
        self.record_transition(transition);
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn hour_of(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or_else(|e| {
        warn!("Retry metrics: cannot truncate {} to the hour: {}", at, e);
        at
    })
}

/// `now - duration`, saturating at the earliest representable time.
fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitState, TransitionReason};
    use crate::errors::TransportError;
    use chrono::TimeZone;

    fn attempt_at(endpoint: &str, success: bool, at: DateTime<Utc>) -> RetryAttempt {
        let mut attempt = if success {
            RetryAttempt::success(Uuid::new_v4(), Arc::from(endpoint), 1, Duration::from_millis(100))
        } else {
            RetryAttempt::failure(
                Uuid::new_v4(),
                Arc::from(endpoint),
                1,
                &AttemptFailure::from(TransportError::connect("refused")),
                Duration::from_millis(300),
            )
        };
        attempt.at = at;
        attempt
    }

    fn transition(at: DateTime<Utc>) -> CircuitTransition {
        CircuitTransition {
            endpoint_id: Arc::from("a"),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            at,
            reason: TransitionReason::ThresholdReached,
            next_test_at: None,
            sequence: 0,
        }
    }

    #[test]
    fn test_summary_counts() {
        let metrics = RetryMetrics::new();
        let now = Utc::now();
        metrics.record_attempt(attempt_at("a", false, now));
        metrics.record_attempt(attempt_at("b", true, now));
        metrics.record_request(2, true);
        metrics.record_attempt(attempt_at("a", true, now));
        metrics.record_request(1, true);

        let summary = metrics.summary(None);
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.successful_requests, 2);
        assert_eq!(summary.retried_requests, 1);
        assert_eq!(summary.total_attempts, 3);
        assert!((summary.retry_rate - 0.5).abs() < 1e-9);
        assert!((summary.avg_attempts_per_request - 1.5).abs() < 1e-9);

        let a = &summary.endpoints["a"];
        assert_eq!((a.attempts, a.successes, a.failures), (2, 1, 1));
        assert!((a.avg_latency_ms - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RetryMetrics::new().summary(Some(Duration::from_secs(60)));
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.window, Duration::from_secs(60));
    }

    #[test]
    fn test_rollup_aggregates_exactly_once() {
        let metrics = RetryMetrics::new();
        let hour = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        metrics.record_attempt(attempt_at("a", true, hour + TimeDelta::minutes(5)));
        metrics.record_attempt(attempt_at("a", false, hour + TimeDelta::minutes(50)));

        let now = hour + TimeDelta::minutes(55);
        assert_eq!(metrics.rollup(now), 2);
        assert_eq!(metrics.rollup(now), 0);

        let series = metrics.hourly_series();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].hour, hour);
        assert_eq!(series[0].attempts, 2);
        assert_eq!(series[0].successes, 1);
        assert!(series[0]
            .avg_latency_ms()
            .is_some_and(|ms| (ms - 200.0).abs() < 1e-6));

        metrics.record_attempt(attempt_at("a", true, hour + TimeDelta::minutes(65)));
        assert_eq!(metrics.rollup(hour + TimeDelta::minutes(70)), 1);
        assert_eq!(metrics.hourly_series().len(), 2);
    }

    #[test]
    fn test_rollup_skips_future_records() {
        let metrics = RetryMetrics::new();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        metrics.record_attempt(attempt_at("a", true, now + TimeDelta::minutes(1)));

        assert_eq!(metrics.rollup(now), 0);
        assert_eq!(metrics.rollup(now + TimeDelta::minutes(2)), 1);
    }

    #[test]
    fn test_retention_prunes_old_data() {
        let metrics = RetryMetrics::new();
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        metrics.record_attempt(attempt_at("a", true, start));
        metrics.rollup(start);

        // Two hours later the raw attempt is gone, its bucket is not.
        metrics.rollup(start + TimeDelta::hours(2));
        assert_eq!(metrics.state().attempts.len(), 0);
        assert_eq!(metrics.hourly_series().len(), 1);

        // A day later the bucket is gone too.
        metrics.rollup(start + TimeDelta::hours(26));
        assert!(metrics.hourly_series().is_empty());
    }

    #[test]
    fn test_raw_records_bounded_without_rollup() {
        let metrics = RetryMetrics::new();
        let now = Utc::now();
        let stale = now - TimeDelta::hours(3);
        for i in 0..10_000 {
            metrics.record_attempt(attempt_at("a", i % 2 == 0, stale + TimeDelta::milliseconds(i)));
        }
        assert_eq!(metrics.state().attempts.len(), 10_000);

        metrics.record_attempt(attempt_at("a", true, now));
        assert_eq!(metrics.state().attempts.len(), 1);

        // Nothing was lost: the expired records went to their hourly bucket.
        let series = metrics.hourly_series();
        assert_eq!(series.iter().map(|h| h.attempts).sum::<u64>(), 10_000);
        assert_eq!(series.iter().map(|h| h.successes).sum::<u64>(), 5_000);

        // A later rollup folds only the fresh record.
        assert_eq!(metrics.rollup(now), 1);
        assert_eq!(metrics.hourly_series().iter().map(|h| h.attempts).sum::<u64>(), 10_001);
    }

    #[test]
    fn test_transition_ring_is_bounded() {
        let metrics = RetryMetrics::with_config(MetricsConfig {
            transition_capacity: 3,
            ..Default::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            metrics.emit(&transition(now + TimeDelta::seconds(i)));
        }

        let recent = metrics.recent_transitions(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].at, now + TimeDelta::seconds(2));
        assert_eq!(metrics.recent_transitions(1)[0].at, now + TimeDelta::seconds(4));
    }

    #[test]
    fn test_config_deserializes() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{"rollupInterval": "1m", "transitionCapacity": 10}"#).unwrap();
        assert_eq!(config.rollup_interval, Duration::from_secs(60));
        assert_eq!(config.transition_capacity, 10);
        assert_eq!(config.hourly_retention, Duration::from_secs(86_400));
    }

    struct CountingSink(Mutex<usize>);

    impl MetricsSink for CountingSink {
        fn publish(&self, _summary: &RetryMetricsSummary, _hourly: &[HourlyRollup]) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollup_task_publishes_until_cancelled() {
        let metrics = Arc::new(RetryMetrics::new());
        let sink = Arc::new(CountingSink(Mutex::new(0)));
        let cancel = CancellationToken::new();

        let handle = metrics
            .spawn_rollup_task(
                Duration::from_secs(300),
                Some(sink.clone() as Arc<dyn MetricsSink>),
                cancel.clone(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Immediate first tick plus one after five minutes.
        assert_eq!(*sink.0.lock().unwrap(), 2);
    }
}
