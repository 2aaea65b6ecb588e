/// Classification for retry policy.
///
/// Used by the rotator to decide what happens after a failed attempt.
///
/// # Behavior Summary
///
/// | Class | Try Another Endpoint? | Record Circuit Breaker Failure? |
/// |-------|-----------------------|--------------------------------|
/// | `FailoverWithPenalty` | Yes | Yes |
/// | `AbortWithPenalty` | No | Yes |
/// | `Never` | No | No |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Retry on another endpoint and record a circuit breaker penalty.
    ///
    /// Used for transport faults (connect, timeout, read/write, pool
    /// exhaustion, network) and for statuses listed in the policy's
    /// retryable set. After enough penalties the endpoint's circuit opens
    /// and it drops out of the candidate list.
    FailoverWithPenalty,

    /// Stop the attempt loop but still penalise the endpoint.
    ///
    /// Used for proxy authentication failures, and for retryable faults on
    /// non-idempotent requests when the policy forbids replaying them.
    AbortWithPenalty,

    /// Stop the attempt loop without penalising the endpoint.
    ///
    /// The endpoint delivered a response; the upstream just did not like
    /// the request (e.g. 404 or 400).
    Never,
}

impl RetryClass {
    /// Whether the rotator may start another attempt.
    pub fn allows_retry(self) -> bool {
        matches!(self, Self::FailoverWithPenalty)
    }

    /// Whether the failure counts against the endpoint's health.
    pub fn penalises_endpoint(self) -> bool {
        matches!(self, Self::FailoverWithPenalty | Self::AbortWithPenalty)
    }
}
