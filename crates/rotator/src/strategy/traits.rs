//! Rotation strategy trait definition.

use std::sync::Arc;
use std::time::Duration;

use crate::models::{Endpoint, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::Result;

/// Trait for endpoint selection algorithms.
///
/// Implement this trait to add a new rotation policy, then register a
/// factory for it on the [`StrategyRegistry`](super::StrategyRegistry).
///
/// Implementations are shared across request tasks, so both methods take
/// `&self` and must complete in bounded time without blocking.
///
/// # Example
///
/// ```ignore
/// use egress_rotator::strategy::{RotationStrategy, StrategyRegistry};
///
/// struct FirstOnly;
///
/// impl RotationStrategy for FirstOnly {
///     fn select(&self, candidates: &PoolSnapshot, _: &SelectionContext) -> Result<Arc<Endpoint>> {
///         candidates.endpoints().first().cloned().ok_or_else(|| ...)
///     }
///
///     fn record_result(&self, _: &Endpoint, _: bool, _: Duration) {}
/// }
///
/// registry.register("first_only", |_| Ok(Arc::new(FirstOnly)));
/// ```
pub trait RotationStrategy: Send + Sync {
    /// Choose one endpoint among `candidates`.
    ///
    /// The candidates are already restricted to endpoints the caller
    /// considers eligible. Fails with
    /// [`RotatorError::PoolUnavailable`](crate::errors::RotatorError::PoolUnavailable)
    /// when nothing can be chosen.
    fn select(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<Arc<Endpoint>>;

    /// Narrow `candidates` to the endpoints this strategy would ever pick
    /// for `context`.
    ///
    /// Failover selection bypasses [`select`](Self::select), so any hard
    /// restriction (region targeting, composite filters) must be expressed
    /// here too. The default keeps every candidate.
    fn filter_candidates(
        &self,
        candidates: &PoolSnapshot,
        _context: &SelectionContext,
    ) -> Result<PoolSnapshot> {
        Ok(candidates.clone())
    }

    /// Feed back the outcome of an attempt through `endpoint`.
    ///
    /// Calls are additive: two identical calls are two outcomes.
    fn record_result(&self, endpoint: &Endpoint, success: bool, latency: Duration);
}
