//! Error types and retry classification for the rotator crate.
//!
//! This module provides:
//! - [`RotatorError`]: The main error enum returned to callers
//! - [`AttemptFailure`]: What went wrong during a single attempt
//! - [`RetryClass`]: Classification for determining retry behavior
//! - [`TransportError`]: Failure reported by the transport collaborator

mod retry;
mod transport;

pub use retry::RetryClass;
pub use transport::{TransportError, TransportErrorKind};

use std::time::Duration;

use thiserror::Error;

use crate::models::EndpointId;
use crate::retry::RetryPolicy;

/// Status returned by an endpoint that refuses our proxy credentials.
pub const PROXY_AUTH_REQUIRED: u16 = 407;

/// The outcome of a single failed attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AttemptFailure {
    /// The transport call itself failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The endpoint answered with a non-success status.
    #[error("unsuccessful status {0}")]
    Status(u16),
}

impl AttemptFailure {
    /// Returns the retry classification for this failure.
    ///
    /// - Network-class transport faults and statuses in the policy's retry
    ///   set fail over to another endpoint, unless the request is not
    ///   idempotent and the policy does not allow replaying it.
    /// - Proxy authentication failures abort and penalise the endpoint.
    /// - Any other status aborts without penalty.
    ///
    /// # Examples
    ///
    /// ```
    /// use egress_rotator::errors::{AttemptFailure, RetryClass, TransportError};
    /// use egress_rotator::retry::RetryPolicy;
    ///
    /// let policy = RetryPolicy::default();
    /// let failure = AttemptFailure::from(TransportError::connect("refused"));
    /// assert_eq!(failure.retry_class(&policy, true), RetryClass::FailoverWithPenalty);
    ///
    /// let failure = AttemptFailure::Status(404);
    /// assert_eq!(failure.retry_class(&policy, true), RetryClass::Never);
    /// ```
    pub fn retry_class(&self, policy: &RetryPolicy, idempotent: bool) -> RetryClass {
        let replayable = idempotent || policy.retry_non_idempotent;

        match self {
            Self::Transport(err) if err.kind.is_retryable() => {
                if replayable {
                    RetryClass::FailoverWithPenalty
                } else {
                    RetryClass::AbortWithPenalty
                }
            }
            Self::Transport(err) if err.kind == TransportErrorKind::ProxyAuth => {
                RetryClass::AbortWithPenalty
            }
            Self::Transport(_) => RetryClass::Never,

            Self::Status(PROXY_AUTH_REQUIRED) => RetryClass::AbortWithPenalty,
            Self::Status(status) if policy.retry_status_codes.contains(status) => {
                if replayable {
                    RetryClass::FailoverWithPenalty
                } else {
                    RetryClass::AbortWithPenalty
                }
            }
            Self::Status(_) => RetryClass::Never,
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> String {
        match self {
            Self::Transport(err) => err.kind.as_str().to_string(),
            Self::Status(status) => format!("status_{status}"),
        }
    }
}

/// Errors that can occur while selecting an endpoint or executing a request.
///
/// Terminal variants carry the attempt count, the last endpoint tried and
/// the last underlying failure so operators can triage without logs.
#[derive(Error, Debug)]
pub enum RotatorError {
    /// No endpoint is eligible: the pool is empty, every circuit is open,
    /// or every candidate was filtered out. Not retried by the rotator.
    #[error("No endpoint available after {attempts} attempt(s): {reason}")]
    PoolUnavailable {
        /// Why nothing was eligible
        reason: String,
        /// Attempts made before the pool ran dry
        attempts: u32,
        /// Last endpoint tried, if any
        last_endpoint: Option<EndpointId>,
        /// Last underlying failure, if any attempt completed
        last_failure: Option<AttemptFailure>,
    },

    /// A retryable transport fault that the policy did not allow replaying
    /// (non-idempotent request without `retry_non_idempotent`).
    #[error("Retryable failure on {endpoint} not replayed after {attempts} attempt(s): {failure}")]
    RetryableTransportFailure {
        /// Endpoint that produced the failure
        endpoint: EndpointId,
        /// Attempts made so far
        attempts: u32,
        /// The failure
        failure: AttemptFailure,
    },

    /// An authentication fault or a status outside the retry set.
    #[error("Non-retryable failure on {endpoint} after {attempts} attempt(s): {failure}")]
    NonRetryableFailure {
        /// Endpoint that produced the failure
        endpoint: EndpointId,
        /// Attempts made so far
        attempts: u32,
        /// The failure
        failure: AttemptFailure,
    },

    /// Every configured attempt was consumed without success.
    #[error("Retry budget exhausted after {attempts} attempt(s), last endpoint {last_endpoint}: {last_failure}")]
    RetryBudgetExhausted {
        /// Attempts made
        attempts: u32,
        /// Last endpoint tried
        last_endpoint: EndpointId,
        /// Last underlying failure
        last_failure: AttemptFailure,
    },

    /// The policy's total timeout elapsed before the request succeeded.
    #[error("Request timeout exceeded after {attempts} attempt(s) ({elapsed:?})")]
    RequestTimeoutExceeded {
        /// Wall-clock time spent
        elapsed: Duration,
        /// Attempts started
        attempts: u32,
        /// Last endpoint tried, if any
        last_endpoint: Option<EndpointId>,
        /// Last underlying failure, if any attempt completed
        last_failure: Option<AttemptFailure>,
    },

    /// The caller cancelled the request.
    #[error("Request cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts started
        attempts: u32,
        /// Last endpoint tried, if any
        last_endpoint: Option<EndpointId>,
    },

    /// No strategy is registered under this name.
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl RotatorError {
    pub(crate) fn pool_unavailable(reason: impl Into<String>) -> Self {
        Self::PoolUnavailable {
            reason: reason.into(),
            attempts: 0,
            last_endpoint: None,
            last_failure: None,
        }
    }

    /// Attach the attempts already made for a request to a
    /// `PoolUnavailable` raised mid-loop. Other variants pass through.
    pub(crate) fn with_attempt_trail(
        self,
        attempts: u32,
        endpoint: Option<EndpointId>,
        failure: Option<AttemptFailure>,
    ) -> Self {
        match self {
            Self::PoolUnavailable { reason, .. } => Self::PoolUnavailable {
                reason,
                attempts,
                last_endpoint: endpoint,
                last_failure: failure,
            },
            other => other,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Number of attempts made before this error was produced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetryableTransportFailure { attempts, .. }
            | Self::NonRetryableFailure { attempts, .. }
            | Self::RetryBudgetExhausted { attempts, .. }
            | Self::RequestTimeoutExceeded { attempts, .. }
            | Self::Cancelled { attempts, .. }
            | Self::PoolUnavailable { attempts, .. } => *attempts,
            Self::StrategyNotFound(_)
            | Self::InvalidConfiguration(_) => 0,
        }
    }

    /// The last underlying attempt failure, when one exists.
    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        match self {
            Self::RetryableTransportFailure { failure, .. }
            | Self::NonRetryableFailure { failure, .. } => Some(failure),
            Self::RetryBudgetExhausted { last_failure, .. } => Some(last_failure),
            Self::RequestTimeoutExceeded { last_failure, .. }
            | Self::PoolUnavailable { last_failure, .. } => last_failure.as_ref(),
            _ => None,
        }
    }

    /// Configuration-time errors are fatal at construction; everything
    /// else is a per-request outcome.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::StrategyNotFound(_) | Self::InvalidConfiguration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn test_connect_failure_fails_over() {
        let failure = AttemptFailure::from(TransportError::connect("refused"));
        assert_eq!(
            failure.retry_class(&policy(), true),
            RetryClass::FailoverWithPenalty
        );
    }

    #[test]
    fn test_every_network_kind_is_retryable() {
        for kind in [
            TransportErrorKind::Connect,
            TransportErrorKind::Timeout,
            TransportErrorKind::Read,
            TransportErrorKind::Write,
            TransportErrorKind::PoolExhausted,
            TransportErrorKind::Network,
        ] {
            let failure = AttemptFailure::from(TransportError::new(kind, "boom"));
            assert!(failure.retry_class(&policy(), true).allows_retry(), "{kind}");
        }
    }

    #[test]
    fn test_proxy_auth_aborts_with_penalty() {
        let failure = AttemptFailure::from(TransportError::proxy_auth("bad credentials"));
        assert_eq!(
            failure.retry_class(&policy(), true),
            RetryClass::AbortWithPenalty
        );

        let failure = AttemptFailure::Status(407);
        assert_eq!(
            failure.retry_class(&policy(), true),
            RetryClass::AbortWithPenalty
        );
    }

    #[test]
    fn test_retry_status_fails_over() {
        let failure = AttemptFailure::Status(503);
        assert_eq!(
            failure.retry_class(&policy(), true),
            RetryClass::FailoverWithPenalty
        );
    }

    #[test]
    fn test_unmatched_status_never_retries() {
        let failure = AttemptFailure::Status(404);
        let class = failure.retry_class(&policy(), true);
        assert_eq!(class, RetryClass::Never);
        assert!(!class.penalises_endpoint());
    }

    #[test]
    fn test_other_transport_error_never_retries() {
        let failure = AttemptFailure::from(TransportError::new(
            TransportErrorKind::Other,
            "invalid header",
        ));
        assert_eq!(failure.retry_class(&policy(), true), RetryClass::Never);
    }

    #[test]
    fn test_non_idempotent_not_replayed_by_default() {
        let failure = AttemptFailure::from(TransportError::timeout("slow"));
        assert_eq!(
            failure.retry_class(&policy(), false),
            RetryClass::AbortWithPenalty
        );

        let permissive = RetryPolicy {
            retry_non_idempotent: true,
            ..RetryPolicy::default()
        };
        assert_eq!(
            failure.retry_class(&permissive, false),
            RetryClass::FailoverWithPenalty
        );
    }

    #[test]
    fn test_error_display() {
        let error = RotatorError::pool_unavailable("all circuits open");
        assert_eq!(
            format!("{}", error),
            "No endpoint available after 0 attempt(s): all circuits open"
        );

        let error = RotatorError::RetryBudgetExhausted {
            attempts: 3,
            last_endpoint: Arc::from("proxy-b"),
            last_failure: AttemptFailure::Status(503),
        };
        assert_eq!(
            format!("{}", error),
            "Retry budget exhausted after 3 attempt(s), last endpoint proxy-b: unsuccessful status 503"
        );
        assert_eq!(error.attempts(), 3);
        assert_eq!(error.last_failure(), Some(&AttemptFailure::Status(503)));
    }

    #[test]
    fn test_pool_unavailable_keeps_attempt_trail() {
        let error = RotatorError::pool_unavailable("all circuits open").with_attempt_trail(
            2,
            Some(Arc::from("proxy-a")),
            Some(AttemptFailure::Status(502)),
        );
        assert_eq!(error.attempts(), 2);
        assert_eq!(error.last_failure(), Some(&AttemptFailure::Status(502)));
        assert!(matches!(
            &error,
            RotatorError::PoolUnavailable { last_endpoint: Some(id), .. } if id.as_ref() == "proxy-a"
        ));

        let untouched = RotatorError::invalid("bad").with_attempt_trail(2, None, None);
        assert!(untouched.is_configuration_error());
    }

    #[test]
    fn test_configuration_errors() {
        assert!(RotatorError::StrategyNotFound("nope".to_string()).is_configuration_error());
        assert!(RotatorError::invalid("max_attempts").is_configuration_error());
        assert!(!RotatorError::pool_unavailable("empty").is_configuration_error());
    }
}
