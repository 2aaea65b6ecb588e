//! Candidate filters applied before a strategy makes its final choice.

use log::debug;

use super::CompositeFilterKind;
use crate::models::{Endpoint, HealthStatus, SelectionContext};
use crate::pool::PoolSnapshot;

/// Narrows a candidate list.
pub trait CandidateFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, candidates: &PoolSnapshot, context: &SelectionContext) -> PoolSnapshot;
}

/// Whether `endpoint` satisfies the request's region/country target.
///
/// Both must match when both are given; a request with no geo target
/// matches everything.
pub fn geo_matches(endpoint: &Endpoint, context: &SelectionContext) -> bool {
    let region_ok = context
        .target_region
        .as_deref()
        .map_or(true, |region| endpoint.matches_region(region));
    let country_ok = context
        .target_country
        .as_deref()
        .map_or(true, |country| endpoint.matches_country(country));

    region_ok && country_ok
}

/// Keeps endpoints tagged with the requested region/country.
pub struct GeoFilter {
    fallback_enabled: bool,
}

impl GeoFilter {
    pub fn new(fallback_enabled: bool) -> Self {
        Self { fallback_enabled }
    }
}

impl CandidateFilter for GeoFilter {
    fn name(&self) -> &'static str {
        "geo"
    }

    fn apply(&self, candidates: &PoolSnapshot, context: &SelectionContext) -> PoolSnapshot {
        if !context.has_geo_target() {
            return candidates.clone();
        }

        let matched = candidates.filter(|e| geo_matches(e, context));
        if matched.is_empty() && self.fallback_enabled {
            debug!(
                "Geo filter: no endpoint matches region={:?} country={:?}, falling back to all {}",
                context.target_region,
                context.target_country,
                candidates.len()
            );
            return candidates.clone();
        }

        matched
    }
}

/// Drops endpoints the pool owner marked unhealthy.
pub struct HealthyFilter;

impl CandidateFilter for HealthyFilter {
    fn name(&self) -> &'static str {
        "healthy"
    }

    fn apply(&self, candidates: &PoolSnapshot, _context: &SelectionContext) -> PoolSnapshot {
        candidates.filter(|e| e.health() != HealthStatus::Unhealthy)
    }
}

pub(crate) fn build_filter(kind: CompositeFilterKind, geo_fallback: bool) -> Box<dyn CandidateFilter> {
    match kind {
        CompositeFilterKind::Geo => Box::new(GeoFilter::new(geo_fallback)),
        CompositeFilterKind::Healthy => Box::new(HealthyFilter),
    }
}
