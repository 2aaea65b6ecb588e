//! Rotation strategies.
//!
//! This module provides:
//! - [`RotationStrategy`]: The two-method contract every algorithm implements
//! - [`StrategyRegistry`]: Name-keyed factories, built-ins included
//! - One module per built-in strategy
//! - [`CandidateFilter`]s used by the composite and geo strategies

mod composite;
mod config;
mod filters;
mod geo;
mod least_used;
mod performance;
mod random;
mod registry;
mod round_robin;
mod sticky;
mod traits;
mod weighted;

pub use composite::CompositeStrategy;
pub use config::{CompositeFilterKind, StrategyConfig, DEFAULT_EXPLORATION_TRIALS};
pub use filters::{geo_matches, CandidateFilter, GeoFilter, HealthyFilter};
pub use geo::GeoTargetedStrategy;
pub use least_used::LeastUsedStrategy;
pub use performance::PerformanceStrategy;
pub use random::RandomStrategy;
pub use registry::{
    BuildContext, StrategyFactory, StrategyRegistry, COMPOSITE, GEO_TARGETED, LEAST_USED,
    PERFORMANCE_BASED, RANDOM, ROUND_ROBIN, STICKY_SESSION, WEIGHTED,
};
pub use round_robin::RoundRobinStrategy;
pub use sticky::StickySessionStrategy;
pub use traits::RotationStrategy;
pub use weighted::WeightedStrategy;
