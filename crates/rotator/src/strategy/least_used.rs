use std::sync::Arc;
use std::time::Duration;

use super::RotationStrategy;
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Picks the endpoint with the fewest in-flight, then fewest attempted,
/// requests. Ties go to the earliest endpoint in pool order.
#[derive(Default)]
pub struct LeastUsedStrategy;

impl LeastUsedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl RotationStrategy for LeastUsedStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        // `min_by_key` keeps the first of equal minima.
        candidates
            .endpoints()
            .iter()
            .min_by_key(|e| (e.in_flight(), e.requests_started()))
            .cloned()
            .ok_or_else(|| RotatorError::pool_unavailable("no candidates for least-used selection"))
    }

    fn record_result(&self, _endpoint: &Endpoint, _success: bool, _latency: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> PoolSnapshot {
        PoolSnapshot::new(
            1,
            vec![
                Arc::new(Endpoint::new("a", "http://a:1")),
                Arc::new(Endpoint::new("b", "http://b:1")),
                Arc::new(Endpoint::new("c", "http://c:1")),
            ],
        )
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let strategy = LeastUsedStrategy::new();
        let chosen = strategy.select(&snapshot(), &SelectionContext::new()).unwrap();
        assert_eq!(chosen.id().as_ref(), "a");
    }

    #[test]
    fn test_prefers_fewest_in_flight() {
        let strategy = LeastUsedStrategy::new();
        let candidates = snapshot();
        candidates.endpoints()[0].begin_request();
        candidates.endpoints()[1].begin_request();

        let chosen = strategy.select(&candidates, &SelectionContext::new()).unwrap();
        assert_eq!(chosen.id().as_ref(), "c");
    }

    #[test]
    fn test_completed_requests_still_count_as_usage() {
        let strategy = LeastUsedStrategy::new();
        let candidates = snapshot();
        for e in &candidates.endpoints()[..2] {
            e.begin_request();
            e.record_outcome(true, Duration::from_millis(1));
        }

        // Nothing in flight anywhere; "c" has the fewest attempts.
        let chosen = strategy.select(&candidates, &SelectionContext::new()).unwrap();
        assert_eq!(chosen.id().as_ref(), "c");
    }

    #[test]
    fn test_rotates_when_usage_is_recorded() {
        let strategy = LeastUsedStrategy::new();
        let candidates = snapshot();

        let mut order = Vec::new();
        for _ in 0..3 {
            let chosen = strategy.select(&candidates, &SelectionContext::new()).unwrap();
            chosen.begin_request();
            order.push(chosen.id().to_string());
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
