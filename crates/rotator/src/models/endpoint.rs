use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::EndpointId;
use crate::sync::lock;

/// Default smoothing factor for the latency moving average.
pub const DEFAULT_EMA_ALPHA: f64 = 0.3;

/// Number of latency samples kept for percentile estimates.
const LATENCY_SAMPLE_CAPACITY: usize = 256;

/// Health as reported by the pool owner.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    fn to_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Unhealthy => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Healthy,
            2 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

/// Latency percentiles over the retained samples, in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug)]
struct LatencyTracker {
    ema_ms: Option<f64>,
    samples: VecDeque<f64>,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            ema_ms: None,
            samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAPACITY),
        }
    }

    fn record(&mut self, latency_ms: f64, alpha: f64) {
        self.ema_ms = Some(match self.ema_ms {
            Some(ema) => alpha * latency_ms + (1.0 - alpha) * ema,
            None => latency_ms,
        });

        if self.samples.len() == LATENCY_SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn percentiles(&self) -> Option<LatencyPercentiles> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        // Nearest-rank percentile.
        let rank = |p: f64| {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[idx.clamp(1, sorted.len()) - 1]
        };

        Some(LatencyPercentiles {
            p50: rank(50.0),
            p95: rank(95.0),
            p99: rank(99.0),
        })
    }
}

/// Runtime statistics for an endpoint.
///
/// Counters are atomics so selection can read them without locking; only the
/// latency tracker sits behind a mutex.
#[derive(Debug)]
struct EndpointStats {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    latency: Mutex<LatencyTracker>,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            requests_started: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            latency: Mutex::new(LatencyTracker::new()),
        }
    }
}

/// A candidate egress endpoint (proxy).
///
/// Identity and tags are fixed at construction. Statistics are mutated by the
/// rotator after every attempt; health is set by the pool owner.
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    url: String,
    region: Option<String>,
    country: Option<String>,
    tags: BTreeMap<String, String>,
    ema_alpha: f64,
    health: AtomicU8,
    stats: EndpointStats,
}

impl Endpoint {
    pub fn new(id: impl Into<EndpointId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            region: None,
            country: None,
            tags: BTreeMap::new(),
            ema_alpha: DEFAULT_EMA_ALPHA,
            health: AtomicU8::new(HealthStatus::Unknown.to_u8()),
            stats: EndpointStats::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Override the latency EMA smoothing factor (clamped to `(0, 1]`).
    pub fn with_ema_alpha(mut self, alpha: f64) -> Self {
        if alpha.is_finite() && alpha > 0.0 {
            self.ema_alpha = alpha.min(1.0);
        }
        self
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn set_health(&self, health: HealthStatus) {
        self.health.store(health.to_u8(), Ordering::Release);
    }

    pub fn matches_region(&self, region: &str) -> bool {
        self.region
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case(region))
    }

    pub fn matches_country(&self, country: &str) -> bool {
        self.country
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(country))
    }

    /// Mark the start of an attempt through this endpoint.
    pub fn begin_request(&self) {
        self.stats.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    /// End an attempt that produced no outcome (cancelled, or cut short by
    /// the request deadline). Nothing is counted against the endpoint.
    pub fn abandon_request(&self) {
        let _ = self.stats.requests_started.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |started| started.checked_sub(1),
        );
    }

    /// Record the outcome of an attempt.
    ///
    /// Accounting is additive: two calls with identical arguments count as
    /// two outcomes. Any success resets `consecutive_failures`.
    pub fn record_outcome(&self, success: bool, latency: Duration) {
        self.stats.requests_completed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.stats.successes.fetch_add(1, Ordering::Relaxed);
            self.stats.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            self.stats
                .consecutive_failures
                .fetch_add(1, Ordering::Relaxed);
        }

        lock(&self.stats.latency, "Endpoint latency")
            .record(latency.as_secs_f64() * 1000.0, self.ema_alpha);
    }

    pub fn requests_started(&self) -> u64 {
        self.stats.requests_started.load(Ordering::Relaxed)
    }

    pub fn requests_completed(&self) -> u64 {
        self.stats.requests_completed.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.stats.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.stats.failures.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Attempts started but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.requests_started()
            .saturating_sub(self.requests_completed())
    }

    /// Observed success rate, `None` before the first completed request.
    pub fn success_rate(&self) -> Option<f64> {
        let completed = self.requests_completed();
        (completed > 0).then(|| self.successes() as f64 / completed as f64)
    }

    /// Laplace-smoothed success rate; 0.5 for an untested endpoint.
    pub fn smoothed_success_rate(&self) -> f64 {
        (self.successes() as f64 + 1.0) / (self.requests_completed() as f64 + 2.0)
    }

    pub fn ema_latency_ms(&self) -> Option<f64> {
        lock(&self.stats.latency, "Endpoint latency").ema_ms
    }

    pub fn latency_percentiles(&self) -> Option<LatencyPercentiles> {
        lock(&self.stats.latency, "Endpoint latency").percentiles()
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id.to_string(),
            url: self.url.clone(),
            region: self.region.clone(),
            country: self.country.clone(),
            health: self.health(),
            requests_started: self.requests_started(),
            requests_completed: self.requests_completed(),
            successes: self.successes(),
            failures: self.failures(),
            consecutive_failures: self.consecutive_failures(),
            in_flight: self.in_flight(),
            success_rate: self.success_rate(),
            ema_latency_ms: self.ema_latency_ms(),
            latency: self.latency_percentiles(),
        }
    }
}

/// Point-in-time view of an endpoint for monitoring.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub id: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub health: HealthStatus,
    pub requests_started: u64,
    pub requests_completed: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub in_flight: u64,
    pub success_rate: Option<f64>,
    pub ema_latency_ms: Option<f64>,
    pub latency: Option<LatencyPercentiles>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_endpoint_has_no_history() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080");
        assert_eq!(endpoint.health(), HealthStatus::Unknown);
        assert_eq!(endpoint.success_rate(), None);
        assert_eq!(endpoint.ema_latency_ms(), None);
        assert!((endpoint.smoothed_success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080");
        endpoint.record_outcome(false, Duration::from_millis(10));
        endpoint.record_outcome(false, Duration::from_millis(10));
        assert_eq!(endpoint.consecutive_failures(), 2);

        endpoint.record_outcome(true, Duration::from_millis(10));
        assert_eq!(endpoint.consecutive_failures(), 0);
        assert_eq!(endpoint.failures(), 2);
        assert_eq!(endpoint.successes(), 1);
    }

    #[test]
    fn test_record_outcome_is_additive() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080");
        endpoint.record_outcome(true, Duration::from_millis(40));
        endpoint.record_outcome(true, Duration::from_millis(40));

        assert_eq!(endpoint.requests_completed(), 2);
        assert_eq!(endpoint.successes(), 2);
    }

    #[test]
    fn test_in_flight_tracks_started_minus_completed() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080");
        endpoint.begin_request();
        endpoint.begin_request();
        assert_eq!(endpoint.in_flight(), 2);

        endpoint.record_outcome(true, Duration::from_millis(5));
        assert_eq!(endpoint.in_flight(), 1);

        endpoint.abandon_request();
        assert_eq!(endpoint.in_flight(), 0);
        assert_eq!(endpoint.requests_completed(), 1);
        assert_eq!(endpoint.failures(), 0);
    }

    #[test]
    fn test_latency_ema() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080").with_ema_alpha(0.5);
        endpoint.record_outcome(true, Duration::from_millis(100));
        assert_eq!(endpoint.ema_latency_ms(), Some(100.0));

        endpoint.record_outcome(true, Duration::from_millis(200));
        assert_eq!(endpoint.ema_latency_ms(), Some(150.0));
    }

    #[test]
    fn test_latency_percentiles() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080");
        for ms in 1..=100 {
            endpoint.record_outcome(true, Duration::from_millis(ms));
        }

        let p = endpoint.latency_percentiles().unwrap();
        assert!((p.p50 - 50.0).abs() < 0.5);
        assert!((p.p95 - 95.0).abs() < 0.5);
        assert!((p.p99 - 99.0).abs() < 0.5);
    }

    #[test]
    fn test_region_matching_is_case_insensitive() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080")
            .with_region("EU")
            .with_country("de");
        assert!(endpoint.matches_region("eu"));
        assert!(endpoint.matches_country("DE"));
        assert!(!endpoint.matches_region("US"));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let endpoint = Endpoint::new("p1", "http://10.0.0.1:8080").with_region("EU");
        endpoint.set_health(HealthStatus::Healthy);

        let json = serde_json::to_value(endpoint.snapshot()).unwrap();
        assert_eq!(json["id"], "p1");
        assert_eq!(json["health"], "healthy");
        assert_eq!(json["requestsStarted"], 0);
        assert!(json.get("country").is_none());
    }
}
