use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::RotationStrategy;
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Sequential rotation over the candidates, in pool order.
///
/// The cursor is a single atomic, so concurrent selections never block and
/// never hand out the same index twice in a row.
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStrategy for RoundRobinStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        if candidates.is_empty() {
            return Err(RotatorError::pool_unavailable("no candidates for round robin"));
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates.endpoints()[index].clone())
    }

    fn record_result(&self, _endpoint: &Endpoint, _success: bool, _latency: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ids: &[&str]) -> PoolSnapshot {
        PoolSnapshot::new(
            1,
            ids.iter()
                .map(|id| Arc::new(Endpoint::new(*id, format!("http://{id}:1"))))
                .collect(),
        )
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let strategy = RoundRobinStrategy::new();
        let candidates = snapshot(&["a", "b", "c"]);
        let context = SelectionContext::new();

        let picks: Vec<String> = (0..6)
            .map(|_| strategy.select(&candidates, &context).unwrap().id().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_empty() {
        let strategy = RoundRobinStrategy::new();
        let result = strategy.select(&snapshot(&[]), &SelectionContext::new());
        assert!(matches!(result, Err(RotatorError::PoolUnavailable { .. })));
    }

    #[test]
    fn test_round_robin_concurrent_selections_are_fair() {
        let strategy = Arc::new(RoundRobinStrategy::new());
        let candidates = snapshot(&["a", "b", "c", "d"]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strategy = strategy.clone();
                let candidates = candidates.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| {
                            strategy
                                .select(&candidates, &SelectionContext::new())
                                .unwrap()
                                .id()
                                .to_string()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                *counts.entry(id).or_insert(0) += 1;
            }
        }

        // 4000 selections over 4 endpoints: exactly 1000 each.
        assert!(counts.values().all(|&count| count == 1000));
    }
}
