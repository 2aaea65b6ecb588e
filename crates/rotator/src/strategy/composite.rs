use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use super::filters::{build_filter, CandidateFilter};
use super::{RotationStrategy, StrategyConfig};
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Ordered filters followed by an inner strategy.
///
/// Selection cost is the sum of the filter passes plus the inner strategy;
/// a selection slower than `budget` is logged.
pub struct CompositeStrategy {
    filters: Vec<Box<dyn CandidateFilter>>,
    inner: Arc<dyn RotationStrategy>,
    budget: Duration,
}

impl CompositeStrategy {
    pub fn new(
        filters: Vec<Box<dyn CandidateFilter>>,
        inner: Arc<dyn RotationStrategy>,
        budget: Duration,
    ) -> Self {
        Self {
            filters,
            inner,
            budget,
        }
    }

    pub fn from_config(config: &StrategyConfig, inner: Arc<dyn RotationStrategy>) -> Self {
        let filters = config
            .composite_filters
            .iter()
            .map(|kind| build_filter(*kind, config.geo_fallback_enabled))
            .collect();
        Self::new(filters, inner, config.selection_budget)
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    fn apply_filters(&self, candidates: &PoolSnapshot, context: &SelectionContext) -> Result<PoolSnapshot> {
        let mut current = candidates.clone();
        for filter in &self.filters {
            current = filter.apply(&current, context);
            if current.is_empty() {
                return Err(RotatorError::pool_unavailable(format!(
                    "composite filter '{}' removed every candidate",
                    filter.name()
                )));
            }
        }
        Ok(current)
    }
}

impl RotationStrategy for CompositeStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        let started = Instant::now();

        let result = self
            .apply_filters(candidates, context)
            .and_then(|current| self.inner.select(&current, context));

        let elapsed = started.elapsed();
        if elapsed > self.budget {
            warn!(
                "Composite selection took {:?} over {} candidates (budget {:?})",
                elapsed,
                candidates.len(),
                self.budget
            );
        }

        result
    }

    fn filter_candidates(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<PoolSnapshot> {
        let current = self.apply_filters(candidates, context)?;
        self.inner.filter_candidates(&current, context)
    }

    fn record_result(&self, endpoint: &Endpoint, success: bool, latency: Duration) {
        self.inner.record_result(endpoint, success, latency);
    }
}
