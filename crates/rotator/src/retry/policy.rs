use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RotatorError;
use crate::Result;

/// Bounds on `max_attempts`.
pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 10;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// How the delay between attempts grows.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Weights used to rank endpoints when failing over.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailoverScoring {
    pub success_weight: f64,
    pub latency_weight: f64,
    /// Relative bonus for endpoints in the request's target region.
    pub region_bonus: f64,
}

impl Default for FailoverScoring {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            latency_weight: 0.3,
            region_bonus: 0.10,
        }
    }
}

impl FailoverScoring {
    pub fn validate(&self) -> Result<()> {
        let parts = [self.success_weight, self.latency_weight, self.region_bonus];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RotatorError::invalid(
                "failover scoring weights must be finite and non-negative",
            ));
        }
        if self.success_weight + self.latency_weight <= 0.0 {
            return Err(RotatorError::invalid(
                "failover scoring needs a positive success or latency weight",
            ));
        }
        Ok(())
    }
}

/// Retry configuration for one request, or the rotator-wide default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first (1..=10)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Cap on the computed (pre-jitter) exponential delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiply each delay by a random factor in [0.5, 1.5]
    pub jitter: bool,
    /// Response statuses that fail over to another endpoint
    pub retry_status_codes: BTreeSet<u16>,
    /// Wall-clock budget across all attempts
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Allow replaying POST/PATCH/CONNECT
    pub retry_non_idempotent: bool,
    pub scoring: FailoverScoring,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffStrategy::Exponential,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
            retry_status_codes: DEFAULT_RETRY_STATUSES.into_iter().collect(),
            timeout: None,
            retry_non_idempotent: false,
            scoring: FailoverScoring::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, base_delay: Duration) -> Self {
        self.backoff = backoff;
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_non_idempotent(mut self, allow: bool) -> Self {
        self.retry_non_idempotent = allow;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&self.max_attempts) {
            return Err(RotatorError::invalid(format!(
                "maxAttempts must be between {MIN_ATTEMPTS} and {MAX_ATTEMPTS}, got {}",
                self.max_attempts
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(RotatorError::invalid(format!(
                "multiplier must be positive, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.base_delay && self.backoff == BackoffStrategy::Exponential {
            return Err(RotatorError::invalid(
                "maxDelay must not be smaller than baseDelay",
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(RotatorError::invalid("timeout must be positive when set"));
        }
        if let Some(status) = self
            .retry_status_codes
            .iter()
            .find(|s| !(100..=599).contains(*s))
        {
            return Err(RotatorError::invalid(format!(
                "retry status {status} is not an HTTP status"
            )));
        }
        self.scoring.validate()
    }
}
