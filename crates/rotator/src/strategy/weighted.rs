use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use rand::distributions::{Distribution, WeightedIndex};

use super::{RotationStrategy, StrategyConfig};
use crate::errors::RotatorError;
use crate::models::{Endpoint, EndpointId, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::sync::{read, write};
use crate::Result;

/// Cached weights for one pool generation.
struct WeightCache {
    generation: u64,
    built_at: Instant,
    weights: HashMap<EndpointId, f64>,
}

/// Draw proportional to a per-endpoint weight.
///
/// The weight is the explicit value from configuration when one is set for
/// the endpoint, otherwise its smoothed success rate. Weights are cached and
/// rebuilt when the pool generation changes or the cache ages past its TTL;
/// readers may see a slightly stale vector.
pub struct WeightedStrategy {
    explicit: HashMap<String, f64>,
    cache_ttl: Duration,
    cache: RwLock<Option<WeightCache>>,
}

impl WeightedStrategy {
    pub fn new(explicit: HashMap<String, f64>, cache_ttl: Duration) -> Self {
        Self {
            explicit,
            cache_ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.weights.clone(), config.weight_cache_ttl)
    }

    fn weight_for(&self, endpoint: &Endpoint) -> f64 {
        let weight = self
            .explicit
            .get(endpoint.id().as_ref())
            .copied()
            .unwrap_or_else(|| endpoint.smoothed_success_rate());

        if weight.is_finite() && weight > 0.0 {
            weight
        } else {
            0.0
        }
    }

    fn cached_weights(&self, candidates: &PoolSnapshot) -> Option<Vec<f64>> {
        let cache = read(&self.cache, "Weight cache");
        let cache = cache.as_ref()?;
        if cache.generation != candidates.generation() || cache.built_at.elapsed() > self.cache_ttl
        {
            return None;
        }

        Some(
            candidates
                .endpoints()
                .iter()
                .map(|e| {
                    cache
                        .weights
                        .get(e.id())
                        .copied()
                        .unwrap_or_else(|| self.weight_for(e))
                })
                .collect(),
        )
    }

    fn rebuild(&self, candidates: &PoolSnapshot) -> Vec<f64> {
        let weights: Vec<f64> = candidates
            .endpoints()
            .iter()
            .map(|e| self.weight_for(e))
            .collect();

        debug!(
            "Weighted strategy: rebuilt weight cache for generation {} ({} endpoints)",
            candidates.generation(),
            weights.len()
        );

        *write(&self.cache, "Weight cache") = Some(WeightCache {
            generation: candidates.generation(),
            built_at: Instant::now(),
            weights: candidates
                .endpoints()
                .iter()
                .map(|e| e.id().clone())
                .zip(weights.iter().copied())
                .collect(),
        });

        weights
    }

    /// Drop cached weights; the next selection rebuilds them.
    pub fn invalidate(&self) {
        *write(&self.cache, "Weight cache") = None;
    }
}

impl RotationStrategy for WeightedStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        if candidates.is_empty() {
            return Err(RotatorError::pool_unavailable(
                "no candidates for weighted selection",
            ));
        }

        let weights = self
            .cached_weights(candidates)
            .unwrap_or_else(|| self.rebuild(candidates));

        draw_weighted(candidates, &weights)
    }

    fn record_result(&self, _endpoint: &Endpoint, _success: bool, _latency: Duration) {}
}

/// Weighted draw over `candidates`; uniform when no weight is positive.
pub(crate) fn draw_weighted(candidates: &PoolSnapshot, weights: &[f64]) -> Result<Arc<Endpoint>> {
    let mut rng = rand::thread_rng();

    let index = match WeightedIndex::new(weights) {
        Ok(dist) => dist.sample(&mut rng),
        // All-zero weights: every eligible endpoint is equally (un)attractive.
        Err(_) => rand::Rng::gen_range(&mut rng, 0..candidates.len()),
    };

    candidates
        .endpoints()
        .get(index)
        .cloned()
        .ok_or_else(|| RotatorError::pool_unavailable("weighted draw out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(generation: u64, ids: &[&str]) -> PoolSnapshot {
        PoolSnapshot::new(
            generation,
            ids.iter()
                .map(|id| Arc::new(Endpoint::new(*id, format!("http://{id}:1"))))
                .collect(),
        )
    }

    fn explicit(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_weighted_frequency_matches_weights() {
        let strategy = WeightedStrategy::new(
            explicit(&[("A", 0.7), ("B", 0.3)]),
            Duration::from_secs(30),
        );
        let candidates = snapshot(1, &["A", "B"]);
        let context = SelectionContext::new();

        let draws = 100_000;
        let a_count = (0..draws)
            .filter(|_| strategy.select(&candidates, &context).unwrap().id().as_ref() == "A")
            .count();

        let freq = a_count as f64 / draws as f64;
        assert!((freq - 0.7).abs() < 0.02, "A frequency {freq}");
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let strategy = WeightedStrategy::new(
            explicit(&[("A", 1.0), ("B", 0.0)]),
            Duration::from_secs(30),
        );
        let candidates = snapshot(1, &["A", "B"]);

        for _ in 0..1000 {
            let chosen = strategy.select(&candidates, &SelectionContext::new()).unwrap();
            assert_eq!(chosen.id().as_ref(), "A");
        }
    }

    #[test]
    fn test_all_zero_weights_fall_back_to_uniform() {
        let strategy = WeightedStrategy::new(
            explicit(&[("A", 0.0), ("B", 0.0)]),
            Duration::from_secs(30),
        );
        let candidates = snapshot(1, &["A", "B"]);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(strategy.select(&candidates, &SelectionContext::new()).unwrap().id().to_string());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_success_rate_weights_without_explicit_config() {
        let strategy = WeightedStrategy::new(HashMap::new(), Duration::from_secs(30));
        let candidates = snapshot(1, &["good", "bad"]);
        for _ in 0..98 {
            candidates.endpoints()[0].record_outcome(true, Duration::from_millis(5));
            candidates.endpoints()[1].record_outcome(false, Duration::from_millis(5));
        }

        let good = (0..1000)
            .filter(|_| {
                strategy.select(&candidates, &SelectionContext::new()).unwrap().id().as_ref()
                    == "good"
            })
            .count();
        // 0.99 vs 0.01 smoothed rates.
        assert!(good > 950, "good selected {good} times");
    }

    #[test]
    fn test_cache_rebuilt_on_generation_change() {
        let strategy = WeightedStrategy::new(explicit(&[("A", 1.0)]), Duration::from_secs(30));
        let first = snapshot(1, &["A"]);
        strategy.select(&first, &SelectionContext::new()).unwrap();
        assert!(strategy.cached_weights(&first).is_some());

        let second = snapshot(2, &["A", "B"]);
        assert!(strategy.cached_weights(&second).is_none());

        strategy.select(&second, &SelectionContext::new()).unwrap();
        assert_eq!(strategy.cached_weights(&second).map(|w| w.len()), Some(2));
    }

    #[test]
    fn test_invalidate_clears_cache() {
        let strategy = WeightedStrategy::new(HashMap::new(), Duration::from_secs(30));
        let candidates = snapshot(1, &["A"]);
        strategy.select(&candidates, &SelectionContext::new()).unwrap();
        strategy.invalidate();
        assert!(strategy.cached_weights(&candidates).is_none());
    }
}
