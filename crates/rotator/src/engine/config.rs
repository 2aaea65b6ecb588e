use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitBreakerConfig, DEFAULT_QUEUE_CAPACITY};
use crate::errors::RotatorError;
use crate::retry::{MetricsConfig, RetryPolicy};
use crate::strategy::{StrategyConfig, ROUND_ROBIN};
use crate::Result;

/// Circuit state persistence settings.
///
/// Disabled by default: every breaker starts `CLOSED` on startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Pending writes held before the oldest is dropped
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Everything a [`Rotator`](super::Rotator) is built from.
///
/// ```json
/// {
///   "strategy": "composite",
///   "strategyConfig": { "secondaryStrategy": "least_used", "compositeFilters": ["geo", "healthy"] },
///   "retryPolicy": { "maxAttempts": 4, "baseDelay": "250ms", "timeout": "20s" },
///   "circuitBreaker": { "failureThreshold": 5, "windowDuration": "60s", "timeoutDuration": "30s" },
///   "circuitOverrides": { "proxy-eu-1": { "failureThreshold": 2 } },
///   "persistence": { "enabled": false },
///   "metrics": { "rollupInterval": "5m" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotatorConfig {
    /// Registered name of the active strategy
    pub strategy: String,
    pub strategy_config: StrategyConfig,
    /// Default policy for requests that do not bring their own
    pub retry_policy: RetryPolicy,
    /// Breaker defaults
    pub circuit_breaker: CircuitBreakerConfig,
    /// Breaker settings for specific endpoints, by id
    pub circuit_overrides: HashMap<String, CircuitBreakerConfig>,
    pub persistence: PersistenceConfig,
    pub metrics: MetricsConfig,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            strategy: ROUND_ROBIN.to_string(),
            strategy_config: StrategyConfig::default(),
            retry_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            circuit_overrides: HashMap::new(),
            persistence: PersistenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl RotatorConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RotatorError::invalid(format!("malformed rotator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Checks value ranges. Whether `strategy` names a registered strategy
    /// is checked when the rotator is built.
    pub fn validate(&self) -> Result<()> {
        if self.strategy.trim().is_empty() {
            return Err(RotatorError::invalid("strategy name must not be empty"));
        }
        self.strategy_config.validate()?;
        self.retry_policy.validate()?;
        self.circuit_breaker.validate()?;
        for (endpoint_id, config) in &self.circuit_overrides {
            config.validate().map_err(|e| {
                RotatorError::invalid(format!("circuit override for '{endpoint_id}': {e}"))
            })?;
        }
        if self.persistence.queue_capacity == 0 {
            return Err(RotatorError::invalid(
                "persistence queueCapacity must be at least 1",
            ));
        }
        self.metrics.validate()
    }
}
