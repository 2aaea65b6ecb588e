use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::filters::geo_matches;
use super::RotationStrategy;
use crate::errors::RotatorError;
use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Restricts candidates to the request's region/country, then lets the inner
/// strategy choose.
///
/// When nothing matches, selection falls back to the unrestricted candidate
/// list if fallback is enabled, and fails with `PoolUnavailable` otherwise,
/// even when non-matching endpoints are healthy.
pub struct GeoTargetedStrategy {
    fallback_enabled: bool,
    inner: Arc<dyn RotationStrategy>,
}

impl GeoTargetedStrategy {
    pub fn new(fallback_enabled: bool, inner: Arc<dyn RotationStrategy>) -> Self {
        Self {
            fallback_enabled,
            inner,
        }
    }
}

impl GeoTargetedStrategy {
    /// Candidates matching the geo target, or the fallback list.
    fn restrict(&self, candidates: &PoolSnapshot, context: &SelectionContext) -> Result<PoolSnapshot> {
        if !context.has_geo_target() {
            return Ok(candidates.clone());
        }

        let matched = candidates.filter(|e| geo_matches(e, context));
        if !matched.is_empty() {
            return Ok(matched);
        }

        if self.fallback_enabled {
            debug!(
                "Geo strategy: no match for region={:?} country={:?}, using unrestricted selection",
                context.target_region, context.target_country
            );
            return Ok(candidates.clone());
        }

        Err(RotatorError::pool_unavailable(format!(
            "no endpoint matches region={} country={}",
            context.target_region.as_deref().unwrap_or("*"),
            context.target_country.as_deref().unwrap_or("*"),
        )))
    }
}

impl RotationStrategy for GeoTargetedStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        let restricted = self.restrict(candidates, context)?;
        self.inner.select(&restricted, context)
    }

    fn filter_candidates(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<PoolSnapshot> {
        let restricted = self.restrict(candidates, context)?;
        self.inner.filter_candidates(&restricted, context)
    }

    fn record_result(&self, endpoint: &Endpoint, success: bool, latency: Duration) {
        self.inner.record_result(endpoint, success, latency);
    }
}
