//! Name-keyed catalog of strategy factories.
//!
//! The registry is an explicit value owned by the rotator, not a process
//! global, so several rotators (and tests) can coexist with different
//! catalogs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, info};

use super::{
    CompositeStrategy, GeoTargetedStrategy, LeastUsedStrategy, PerformanceStrategy,
    RandomStrategy, RotationStrategy, RoundRobinStrategy, StickySessionStrategy, StrategyConfig,
    WeightedStrategy,
};
use crate::errors::RotatorError;
use crate::sync::{read, write};
use crate::Result;

pub const ROUND_ROBIN: &str = "round_robin";
pub const RANDOM: &str = "random";
pub const WEIGHTED: &str = "weighted";
pub const LEAST_USED: &str = "least_used";
pub const PERFORMANCE_BASED: &str = "performance_based";
pub const STICKY_SESSION: &str = "sticky_session";
pub const GEO_TARGETED: &str = "geo_targeted";
pub const COMPOSITE: &str = "composite";

/// Maximum nesting of strategies built through `build_secondary`.
const MAX_BUILD_DEPTH: usize = 4;

/// Constructor for a strategy.
pub type StrategyFactory =
    Arc<dyn Fn(&BuildContext<'_>) -> Result<Arc<dyn RotationStrategy>> + Send + Sync>;

/// What a factory gets to build its strategy.
pub struct BuildContext<'a> {
    registry: &'a StrategyRegistry,
    config: &'a StrategyConfig,
    depth: usize,
}

impl<'a> BuildContext<'a> {
    pub fn config(&self) -> &StrategyConfig {
        self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        self.registry
    }

    /// Build the configured secondary strategy, or `default` if none is set.
    pub fn build_secondary(&self, default: &str) -> Result<Arc<dyn RotationStrategy>> {
        let name = self.config.secondary_strategy.as_deref().unwrap_or(default);
        self.registry.build_at_depth(name, self.config, self.depth + 1)
    }
}

/// Strategy registry.
///
/// `register` and `resolve` may be called concurrently with selection; the
/// factory map is only locked for the lookup itself, never while a factory
/// runs.
pub struct StrategyRegistry {
    factories: RwLock<HashMap<String, StrategyFactory>>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with every built-in strategy.
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        registry.register(ROUND_ROBIN, |_| Ok(Arc::new(RoundRobinStrategy::new())));
        registry.register(RANDOM, |_| Ok(Arc::new(RandomStrategy::new())));
        registry.register(LEAST_USED, |_| Ok(Arc::new(LeastUsedStrategy::new())));
        registry.register(WEIGHTED, |ctx| {
            Ok(Arc::new(WeightedStrategy::from_config(ctx.config())))
        });
        registry.register(PERFORMANCE_BASED, |ctx| {
            Ok(Arc::new(PerformanceStrategy::new(
                ctx.config().exploration_trials,
            )))
        });
        registry.register(STICKY_SESSION, |ctx| {
            let inner = ctx.build_secondary(ROUND_ROBIN)?;
            Ok(Arc::new(StickySessionStrategy::from_config(
                ctx.config(),
                inner,
            )))
        });
        registry.register(GEO_TARGETED, |ctx| {
            let inner = ctx.build_secondary(RANDOM)?;
            Ok(Arc::new(GeoTargetedStrategy::new(
                ctx.config().geo_fallback_enabled,
                inner,
            )))
        });
        registry.register(COMPOSITE, |ctx| {
            let inner = ctx.build_secondary(ROUND_ROBIN)?;
            Ok(Arc::new(CompositeStrategy::from_config(ctx.config(), inner)))
        });

        registry
    }

    /// Register (or replace) a strategy factory under `name`.
    ///
    /// Returns the factory previously registered under that name, if any.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Option<StrategyFactory>
    where
        F: Fn(&BuildContext<'_>) -> Result<Arc<dyn RotationStrategy>> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(factory))
    }

    pub fn register_factory(
        &self,
        name: impl Into<String>,
        factory: StrategyFactory,
    ) -> Option<StrategyFactory> {
        let name = name.into();
        let previous = write(&self.factories, "Strategy registry").insert(name.clone(), factory);
        if previous.is_some() {
            info!("Strategy registry: replaced factory '{}'", name);
        } else {
            debug!("Strategy registry: registered '{}'", name);
        }
        previous
    }

    /// Look up the factory registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<StrategyFactory> {
        read(&self.factories, "Strategy registry")
            .get(name)
            .cloned()
            .ok_or_else(|| RotatorError::StrategyNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.factories, "Strategy registry").contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.factories, "Strategy registry")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve `name` and build a strategy instance from `config`.
    pub fn build(&self, name: &str, config: &StrategyConfig) -> Result<Arc<dyn RotationStrategy>> {
        self.build_at_depth(name, config, 0)
    }

    fn build_at_depth(
        &self,
        name: &str,
        config: &StrategyConfig,
        depth: usize,
    ) -> Result<Arc<dyn RotationStrategy>> {
        if depth >= MAX_BUILD_DEPTH {
            return Err(RotatorError::invalid(format!(
                "strategy nesting deeper than {MAX_BUILD_DEPTH} levels while building '{name}'"
            )));
        }

        // Clone the factory out so the map is not locked while it runs.
        let factory = self.resolve(name)?;
        factory(&BuildContext {
            registry: self,
            config,
            depth,
        })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
