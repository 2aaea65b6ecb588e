//! Endpoint re-selection after a retryable failure.

use std::sync::Arc;

use super::FailoverScoring;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;

/// Scores closer than this are ties.
const SCORE_EPSILON: f64 = 1e-9;

/// Success rate assumed for an endpoint with no completed requests.
const UNTESTED_SUCCESS_RATE: f64 = 1.0;

/// Normalized latency assumed for an endpoint without latency samples.
const UNTESTED_NORMALIZED_LATENCY: f64 = 0.5;

/// Failover score of `endpoint` among candidates whose slowest EMA latency
/// is `max_latency_ms`.
///
/// `score = w_s·success_rate + w_l·(1 − normalized_latency)`, multiplied by
/// `1 + region_bonus` when the endpoint is in the request's target region.
pub fn failover_score(
    endpoint: &Endpoint,
    context: &SelectionContext,
    scoring: &FailoverScoring,
    max_latency_ms: Option<f64>,
) -> f64 {
    let success_rate = endpoint.success_rate().unwrap_or(UNTESTED_SUCCESS_RATE);

    let normalized_latency = match (endpoint.ema_latency_ms(), max_latency_ms) {
        (Some(latency), Some(max)) if max > 0.0 => (latency / max).clamp(0.0, 1.0),
        (Some(_), Some(_)) => 0.0,
        _ => UNTESTED_NORMALIZED_LATENCY,
    };

    let mut score = scoring.success_weight * success_rate
        + scoring.latency_weight * (1.0 - normalized_latency);

    let in_region = context
        .target_region
        .as_deref()
        .is_some_and(|region| endpoint.matches_region(region));
    if in_region {
        score *= 1.0 + scoring.region_bonus;
    }

    score
}

/// Highest-scoring candidate; ties go to the endpoint with the fewest
/// attempts, then to pool order.
pub fn select_failover(
    candidates: &PoolSnapshot,
    context: &SelectionContext,
    scoring: &FailoverScoring,
) -> Option<Arc<Endpoint>> {
    let max_latency_ms = candidates
        .endpoints()
        .iter()
        .filter_map(|e| e.ema_latency_ms())
        .fold(None, |max: Option<f64>, latency| {
            Some(max.map_or(latency, |m| m.max(latency)))
        });

    let mut best: Option<(f64, &Arc<Endpoint>)> = None;
    for endpoint in candidates.endpoints() {
        let score = failover_score(endpoint, context, scoring, max_latency_ms);
        best = match best {
            None => Some((score, endpoint)),
            Some((best_score, best_endpoint)) => {
                let better = score > best_score + SCORE_EPSILON
                    || ((score - best_score).abs() <= SCORE_EPSILON
                        && endpoint.requests_started() < best_endpoint.requests_started());
                if better {
                    Some((score, endpoint))
                } else {
                    Some((best_score, best_endpoint))
                }
            }
        };
    }

    best.map(|(_, endpoint)| Arc::clone(endpoint))
}
