//! Circuit transition events and the sinks that receive them.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CircuitState;
use crate::models::EndpointId;

/// Why a circuit changed state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Failures in the window reached the threshold.
    ThresholdReached,
    /// The open timeout elapsed and a test request was admitted.
    TimeoutElapsed,
    /// The half-open test request succeeded.
    ProbeSucceeded,
    /// The half-open test request failed.
    ProbeFailed,
    /// A success was recorded for a request admitted before the circuit opened.
    SuccessRecorded,
    /// Administrative reset.
    ManualReset,
    /// State loaded from a persistent store at startup.
    Restored,
}

/// One state change of one endpoint's circuit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitTransition {
    pub endpoint_id: EndpointId,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
    /// When the next half-open test becomes possible, for `Open` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_test_at: Option<DateTime<Utc>>,
    /// Process-wide order of transitions. Assigned under the breaker lock,
    /// so a later transition of the same endpoint always has a larger value.
    #[serde(default)]
    pub sequence: u64,
}

/// Receives circuit transitions.
///
/// # Design Rules
///
/// - `emit()` is called on the request path and must not block
/// - Failures inside a sink are the sink's problem; breakers never see them
pub trait TransitionSink: Send + Sync {
    fn emit(&self, transition: &CircuitTransition);
}

/// Discards every transition.
#[derive(Clone, Default)]
pub struct NoOpTransitionSink;

impl TransitionSink for NoOpTransitionSink {
    fn emit(&self, _transition: &CircuitTransition) {}
}

/// Forwards each transition to several sinks in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TransitionSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TransitionSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn TransitionSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TransitionSink for FanoutSink {
    fn emit(&self, transition: &CircuitTransition) {
        for sink in &self.sinks {
            sink.emit(transition);
        }
    }
}

/// Collects transitions in memory. Handy in tests and diagnostics.
#[derive(Clone, Default)]
pub struct CollectingSink {
    transitions: Arc<Mutex<Vec<CircuitTransition>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<CircuitTransition> {
        crate::sync::lock(&self.transitions, "Collecting sink").clone()
    }

    pub fn len(&self) -> usize {
        crate::sync::lock(&self.transitions, "Collecting sink").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransitionSink for CollectingSink {
    fn emit(&self, transition: &CircuitTransition) {
        crate::sync::lock(&self.transitions, "Collecting sink").push(transition.clone());
    }
}
