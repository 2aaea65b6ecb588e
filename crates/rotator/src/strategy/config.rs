use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RotatorError;
use crate::Result;

/// Default number of unweighted trials a new endpoint gets.
pub const DEFAULT_EXPLORATION_TRIALS: u32 = 5;

const DEFAULT_STICKY_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_STICKY_CAPACITY: usize = 10_000;
const DEFAULT_WEIGHT_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_SELECTION_BUDGET: Duration = Duration::from_millis(5);

/// Candidate filters a composite strategy can chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeFilterKind {
    /// Keep endpoints matching the request's region/country.
    Geo,
    /// Drop endpoints the pool owner marked unhealthy.
    Healthy,
}

/// Per-strategy tunables.
///
/// One value configures the whole strategy tree: nested strategies built
/// through [`BuildContext::build_secondary`](super::BuildContext::build_secondary)
/// read the same knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyConfig {
    /// Explicit weights by endpoint id (weighted strategy)
    pub weights: HashMap<String, f64>,

    /// Completed requests before latency weighting applies (performance strategy)
    pub exploration_trials: u32,

    /// How long a session stays bound to an endpoint
    #[serde(with = "humantime_serde")]
    pub sticky_ttl: Duration,

    /// Maximum number of tracked sessions (LRU eviction beyond this)
    pub sticky_capacity: usize,

    /// Fall back to unrestricted selection when no endpoint matches the geo target
    pub geo_fallback_enabled: bool,

    /// Strategy used for the final choice by sticky, geo and composite strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary_strategy: Option<String>,

    /// Maximum age of the weighted strategy's weight cache
    #[serde(with = "humantime_serde")]
    pub weight_cache_ttl: Duration,

    /// Selection time above which a composite selection is logged
    #[serde(with = "humantime_serde")]
    pub selection_budget: Duration,

    /// Filters applied in order by the composite strategy
    pub composite_filters: Vec<CompositeFilterKind>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            exploration_trials: DEFAULT_EXPLORATION_TRIALS,
            sticky_ttl: DEFAULT_STICKY_TTL,
            sticky_capacity: DEFAULT_STICKY_CAPACITY,
            geo_fallback_enabled: true,
            secondary_strategy: None,
            weight_cache_ttl: DEFAULT_WEIGHT_CACHE_TTL,
            selection_budget: DEFAULT_SELECTION_BUDGET,
            composite_filters: vec![CompositeFilterKind::Geo],
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some((id, weight)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(RotatorError::invalid(format!(
                "weight for '{id}' must be a finite non-negative number, got {weight}"
            )));
        }

        if self.sticky_capacity == 0 {
            return Err(RotatorError::invalid("stickyCapacity must be at least 1"));
        }

        if self.sticky_ttl.is_zero() {
            return Err(RotatorError::invalid("stickyTtl must be positive"));
        }

        Ok(())
    }
}
