//! Per-endpoint circuit breaker.
//!
//! Three states:
//!
//! - **Closed**: requests flow; failures are counted in a rolling window.
//! - **Open**: the endpoint is isolated until `timeout_duration` has passed.
//! - **HalfOpen**: exactly one test request is admitted to decide recovery.
//!
//! Each breaker guards its own state with its own mutex, so contention on
//! one endpoint never blocks another. Transitions are computed under the
//! lock and emitted to the sink after it is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::events::{CircuitTransition, NoOpTransitionSink, TransitionReason, TransitionSink};
use super::persistence::PersistedCircuitState;
use crate::errors::RotatorError;
use crate::models::EndpointId;
use crate::sync::lock;
use crate::Result;

/// Source of [`CircuitTransition::sequence`]; starts at 1 so 0 means unsequenced.
static TRANSITION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Default number of in-window failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default length of the rolling failure window.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default time to wait before admitting a half-open test.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests are allowed.
    Closed,
    /// Endpoint is failing - requests are blocked.
    Open,
    /// Testing recovery - a single request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the rolling failure window.
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// Time an open circuit waits before admitting a test request.
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(RotatorError::invalid("circuit failureThreshold must be at least 1"));
        }
        if self.window_duration.is_zero() {
            return Err(RotatorError::invalid("circuit windowDuration must be positive"));
        }
        if self.timeout_duration.is_zero() {
            return Err(RotatorError::invalid("circuit timeoutDuration must be positive"));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window_duration: DEFAULT_WINDOW,
            timeout_duration: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Failure timestamps, oldest first.
    failures: VecDeque<Instant>,
    next_test_at: Option<Instant>,
    test_in_flight: bool,
    last_transition_at: Option<DateTime<Utc>>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            next_test_at: None,
            test_in_flight: false,
            last_transition_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn timeout_elapsed(&self, now: Instant) -> bool {
        self.next_test_at.map_or(true, |at| now >= at)
    }
}

/// Circuit breaker for one endpoint.
pub struct CircuitBreaker {
    endpoint_id: EndpointId,
    config: CircuitBreakerConfig,
    circuit: Mutex<Circuit>,
    sink: Arc<dyn TransitionSink>,
}

impl CircuitBreaker {
    /// Create a breaker that does not report transitions anywhere.
    pub fn new(endpoint_id: EndpointId, config: CircuitBreakerConfig) -> Self {
        Self::with_sink(endpoint_id, config, Arc::new(NoOpTransitionSink))
    }

    pub fn with_sink(
        endpoint_id: EndpointId,
        config: CircuitBreakerConfig,
        sink: Arc<dyn TransitionSink>,
    ) -> Self {
        Self {
            endpoint_id,
            config,
            circuit: Mutex::new(Circuit::new()),
            sink,
        }
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admission gate for a request through this endpoint.
    ///
    /// - `Closed`: always admitted.
    /// - `Open`: once the timeout has elapsed, the circuit moves to
    ///   `HalfOpen` and only the caller that made the move is admitted.
    /// - `HalfOpen`: admitted only while no test request is in flight.
    ///
    /// An admitted half-open test holds the slot until `record_success` or
    /// `record_failure` releases it.
    pub fn should_attempt_request(&self) -> bool {
        let now = Instant::now();
        let (admitted, transition) = {
            let mut circuit = lock(&self.circuit, "Circuit breaker");
            match circuit.state {
                CircuitState::Closed => (true, None),
                CircuitState::Open => {
                    if circuit.timeout_elapsed(now) {
                        circuit.test_in_flight = true;
                        let transition = self.transition(
                            &mut circuit,
                            CircuitState::HalfOpen,
                            TransitionReason::TimeoutElapsed,
                        );
                        (true, Some(transition))
                    } else {
                        (false, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if circuit.test_in_flight {
                        (false, None)
                    } else {
                        circuit.test_in_flight = true;
                        (true, None)
                    }
                }
            }
        };

        self.publish(transition);
        admitted
    }

    /// Whether the endpoint may be offered as a candidate right now.
    ///
    /// Unlike [`should_attempt_request`](Self::should_attempt_request) this
    /// never changes state.
    pub fn is_selectable(&self) -> bool {
        let circuit = lock(&self.circuit, "Circuit breaker");
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => circuit.timeout_elapsed(Instant::now()),
            CircuitState::HalfOpen => !circuit.test_in_flight,
        }
    }

    /// Record a successful request: clears the window and closes the circuit.
    pub fn record_success(&self) {
        let transition = {
            let mut circuit = lock(&self.circuit, "Circuit breaker");
            circuit.failures.clear();
            circuit.test_in_flight = false;
            circuit.next_test_at = None;

            match circuit.state {
                CircuitState::Closed => None,
                CircuitState::HalfOpen => Some(self.transition(
                    &mut circuit,
                    CircuitState::Closed,
                    TransitionReason::ProbeSucceeded,
                )),
                CircuitState::Open => Some(self.transition(
                    &mut circuit,
                    CircuitState::Closed,
                    TransitionReason::SuccessRecorded,
                )),
            }
        };

        self.publish(transition);
    }

    /// Record a failed request.
    ///
    /// Appends to the rolling window and drops entries older than
    /// `window_duration`; the circuit opens once the remaining count reaches
    /// the threshold. A failed half-open test reopens the circuit at once.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let transition = {
            let mut circuit = lock(&self.circuit, "Circuit breaker");
            circuit.failures.push_back(now);
            circuit.prune(now, self.config.window_duration);

            match circuit.state {
                CircuitState::Closed => {
                    let count = circuit.failures.len();
                    if count >= self.config.failure_threshold as usize {
                        circuit.next_test_at = Some(now + self.config.timeout_duration);
                        Some(self.transition(
                            &mut circuit,
                            CircuitState::Open,
                            TransitionReason::ThresholdReached,
                        ))
                    } else {
                        debug!(
                            "Circuit breaker: failure for '{}' ({}/{})",
                            self.endpoint_id, count, self.config.failure_threshold
                        );
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    circuit.test_in_flight = false;
                    circuit.next_test_at = Some(now + self.config.timeout_duration);
                    Some(self.transition(
                        &mut circuit,
                        CircuitState::Open,
                        TransitionReason::ProbeFailed,
                    ))
                }
                CircuitState::Open => {
                    debug!(
                        "Circuit breaker: additional failure for '{}' (already open)",
                        self.endpoint_id
                    );
                    None
                }
            }
        };

        self.publish(transition);
    }

    /// Give back a half-open test slot without an outcome, e.g. when the
    /// test request was cancelled.
    pub fn release_probe(&self) {
        let mut circuit = lock(&self.circuit, "Circuit breaker");
        if circuit.state == CircuitState::HalfOpen && circuit.test_in_flight {
            debug!("Circuit breaker: test slot for '{}' released", self.endpoint_id);
            circuit.test_in_flight = false;
        }
    }

    /// Force the circuit closed and forget its failures.
    pub fn reset(&self) {
        let transition = {
            let mut circuit = lock(&self.circuit, "Circuit breaker");
            circuit.failures.clear();
            circuit.test_in_flight = false;
            circuit.next_test_at = None;

            if circuit.state == CircuitState::Closed {
                None
            } else {
                Some(self.transition(
                    &mut circuit,
                    CircuitState::Closed,
                    TransitionReason::ManualReset,
                ))
            }
        };

        info!("Circuit breaker: manually reset '{}'", self.endpoint_id);
        self.publish(transition);
    }

    /// Apply state loaded from a persistent store.
    ///
    /// The failure window itself is not persisted; an open circuit keeps the
    /// remainder of its timeout, a half-open one is ready for a new test.
    pub fn restore(&self, persisted: &PersistedCircuitState) {
        let now = Instant::now();
        let transition = {
            let mut circuit = lock(&self.circuit, "Circuit breaker");
            if circuit.state == persisted.state {
                return;
            }

            circuit.failures.clear();
            circuit.test_in_flight = false;
            circuit.next_test_at = match persisted.state {
                CircuitState::Open => {
                    let remaining = persisted
                        .next_test_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    Some(now + remaining)
                }
                CircuitState::Closed | CircuitState::HalfOpen => None,
            };
            self.transition(&mut circuit, persisted.state, TransitionReason::Restored)
        };

        self.publish(Some(transition));
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.circuit, "Circuit breaker").state
    }

    /// Failures currently inside the rolling window.
    pub fn failures_in_window(&self) -> usize {
        let now = Instant::now();
        lock(&self.circuit, "Circuit breaker")
            .failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.config.window_duration)
            .count()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let circuit = lock(&self.circuit, "Circuit breaker");
        let failures_in_window = circuit
            .failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.config.window_duration)
            .count();

        CircuitSnapshot {
            endpoint_id: self.endpoint_id.to_string(),
            state: circuit.state,
            failures_in_window,
            failure_threshold: self.config.failure_threshold,
            window_duration: self.config.window_duration,
            timeout_duration: self.config.timeout_duration,
            next_test_in_ms: match circuit.state {
                CircuitState::Open => circuit
                    .next_test_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            test_in_flight: circuit.test_in_flight,
            last_transition_at: circuit.last_transition_at,
        }
    }

    fn transition(
        &self,
        circuit: &mut Circuit,
        to: CircuitState,
        reason: TransitionReason,
    ) -> CircuitTransition {
        let from = circuit.state;
        let at = Utc::now();
        let sequence = TRANSITION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        circuit.state = to;
        circuit.last_transition_at = Some(at);

        let next_test_at = match to {
            CircuitState::Open => circuit.next_test_at.map(|next| {
                let remaining = next.saturating_duration_since(Instant::now());
                at + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
            }),
            _ => None,
        };

        info!(
            "Circuit breaker: '{}' {} -> {} ({:?})",
            self.endpoint_id, from, to, reason
        );

        CircuitTransition {
            endpoint_id: self.endpoint_id.clone(),
            from,
            to,
            at,
            reason,
            next_test_at,
            sequence,
        }
    }

    fn publish(&self, transition: Option<CircuitTransition>) {
        if let Some(transition) = transition {
            self.sink.emit(&transition);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("endpoint_id", &self.endpoint_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Monitoring view of one breaker.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub endpoint_id: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout_duration: Duration,
    /// Milliseconds until an open circuit admits its next test.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_test_in_ms: Option<u64>,
    pub test_in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CollectingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn breaker(threshold: u32, window: Duration, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::from("proxy-a"),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                window_duration: window,
                timeout_duration: timeout,
            },
        )
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = breaker(5, Duration::from_secs(60), Duration::from_secs(30));
        assert!(cb.should_attempt_request());
        assert!(cb.is_selectable());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = breaker(5, Duration::from_secs(60), Duration::from_secs(30));

        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_attempt_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_attempt_request());
        assert!(!cb.is_selectable());
    }

    #[test]
    fn test_window_pruning_prevents_premature_open() {
        let cb = breaker(5, Duration::from_millis(50), Duration::from_secs(30));

        for _ in 0..4 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(80));

        // The earlier four have aged out; one in-window failure stays closed.
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failures_in_window(), 1);
    }

    #[test]
    fn test_success_clears_window() {
        let cb = breaker(3, Duration::from_secs(60), Duration::from_secs(30));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failures_in_window(), 2);

        cb.record_success();
        assert_eq!(cb.failures_in_window(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_to_half_open_only_after_timeout() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_millis(30));
        cb.record_failure();
        assert!(!cb.should_attempt_request());
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(50));

        assert!(cb.is_selectable());
        // Peeking does not transition.
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.should_attempt_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_test() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        assert!(cb.should_attempt_request());
        assert!(!cb.should_attempt_request());
        assert!(!cb.is_selectable());
    }

    #[test]
    fn test_half_open_single_slot_under_contention() {
        let cb = Arc::new(breaker(1, Duration::from_secs(60), Duration::from_millis(10)));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let barrier = Arc::clone(&barrier);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    barrier.wait();
                    if cb.should_attempt_request() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failures_in_window(), 0);
        assert!(cb.should_attempt_request());
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_millis(30));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.should_attempt_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // next test time was pushed out again
        assert!(!cb.should_attempt_request());
        assert!(cb.snapshot().next_test_in_ms.is_some_and(|ms| ms > 0));
    }

    #[test]
    fn test_release_probe_frees_slot() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.should_attempt_request());
        assert!(!cb.should_attempt_request());

        cb.release_probe();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.should_attempt_request());
    }

    #[test]
    fn test_manual_reset() {
        let cb = breaker(1, Duration::from_secs(60), Duration::from_secs(30));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failures_in_window(), 0);
        assert!(cb.should_attempt_request());
    }

    #[test]
    fn test_transitions_are_emitted() {
        let sink = CollectingSink::new();
        let cb = CircuitBreaker::with_sink(
            Arc::from("proxy-a"),
            CircuitBreakerConfig {
                failure_threshold: 1,
                window_duration: Duration::from_secs(60),
                timeout_duration: Duration::from_millis(10),
            },
            Arc::new(sink.clone()),
        );

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.should_attempt_request();
        cb.record_success();

        let reasons: Vec<_> = sink.transitions().iter().map(|t| t.reason).collect();
        assert_eq!(
            reasons,
            vec![
                TransitionReason::ThresholdReached,
                TransitionReason::TimeoutElapsed,
                TransitionReason::ProbeSucceeded,
            ]
        );
        assert!(sink.transitions()[0].next_test_at.is_some());

        let sequences: Vec<u64> = sink.transitions().iter().map(|t| t.sequence).collect();
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]), "{sequences:?}");
        assert!(sequences[0] > 0);
    }

    #[test]
    fn test_restore_open_state() {
        let cb = breaker(5, Duration::from_secs(60), Duration::from_secs(30));
        cb.restore(&PersistedCircuitState {
            endpoint_id: "proxy-a".to_string(),
            state: CircuitState::Open,
            next_test_at: Some(Utc::now() + chrono::Duration::seconds(30)),
            updated_at: Utc::now(),
            sequence: 0,
        });

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_selectable());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let cb = breaker(5, Duration::from_secs(60), Duration::from_secs(30));
        cb.record_failure();

        let json = serde_json::to_value(cb.snapshot()).unwrap();
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["failuresInWindow"], 1);
        assert_eq!(json["windowDuration"], "1m");
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_humantime() {
        let config: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failureThreshold": 3, "timeoutDuration": "10s"}"#).unwrap();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.timeout_duration, Duration::from_secs(10));
        assert_eq!(config.window_duration, Duration::from_secs(60));
    }
}
