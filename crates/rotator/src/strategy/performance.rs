use std::sync::Arc;
use std::time::Duration;

use super::weighted::draw_weighted;
use super::RotationStrategy;
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Floor for the latency used as a divisor, in milliseconds.
const MIN_LATENCY_MS: f64 = 1.0;

/// Weight proportional to `1 / EMA latency`.
///
/// An endpoint with fewer than `exploration_trials` completed requests is
/// still exploring: it gets the best weight among the explored candidates
/// (1.0 when nothing is explored yet) so it is neither favoured nor starved
/// before it has a latency history.
pub struct PerformanceStrategy {
    exploration_trials: u32,
}

impl PerformanceStrategy {
    pub fn new(exploration_trials: u32) -> Self {
        Self { exploration_trials }
    }

    fn latency_weight(&self, endpoint: &Endpoint) -> Option<f64> {
        if endpoint.requests_completed() < u64::from(self.exploration_trials) {
            return None;
        }
        endpoint
            .ema_latency_ms()
            .map(|ms| 1.0 / ms.max(MIN_LATENCY_MS))
    }

    fn weights(&self, candidates: &PoolSnapshot) -> Vec<f64> {
        let explored: Vec<Option<f64>> = candidates
            .endpoints()
            .iter()
            .map(|e| self.latency_weight(e))
            .collect();

        let best = explored
            .iter()
            .flatten()
            .copied()
            .fold(None, |acc: Option<f64>, w| Some(acc.map_or(w, |a| a.max(w))))
            .unwrap_or(1.0);

        explored.into_iter().map(|w| w.unwrap_or(best)).collect()
    }
}

impl RotationStrategy for PerformanceStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        if candidates.is_empty() {
            return Err(RotatorError::pool_unavailable(
                "no candidates for performance-based selection",
            ));
        }

        draw_weighted(candidates, &self.weights(candidates))
    }

    fn record_result(&self, _endpoint: &Endpoint, _success: bool, _latency: Duration) {}
}
