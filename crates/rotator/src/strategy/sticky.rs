use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;

use super::{RotationStrategy, StrategyConfig};
use crate::models::{Endpoint, EndpointId, SelectionContext};
use crate::pool::PoolSnapshot;
use crate::sync::lock;
use crate::Result;

#[derive(Clone, Debug)]
struct Binding {
    endpoint_id: EndpointId,
    bound_at: Instant,
}

/// Binds a session id to one endpoint for up to `ttl`.
///
/// A binding is honoured while its endpoint is among the candidates, and is
/// dropped on expiry, when the endpoint is not eligible, or when a failure is
/// recorded against the endpoint. Requests without a session id, and sessions
/// that need a (new) binding, are served by the inner strategy.
pub struct StickySessionStrategy {
    sessions: Mutex<LruCache<String, Binding>>,
    ttl: Duration,
    inner: Arc<dyn RotationStrategy>,
}

impl StickySessionStrategy {
    pub fn new(capacity: NonZeroUsize, ttl: Duration, inner: Arc<dyn RotationStrategy>) -> Self {
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            ttl,
            inner,
        }
    }

    pub fn from_config(config: &StrategyConfig, inner: Arc<dyn RotationStrategy>) -> Self {
        let capacity = NonZeroUsize::new(config.sticky_capacity).unwrap_or(NonZeroUsize::MIN);
        Self::new(capacity, config.sticky_ttl, inner)
    }

    /// Endpoint currently bound to `session_id`, if the binding is live.
    pub fn binding(&self, session_id: &str) -> Option<EndpointId> {
        let sessions = lock(&self.sessions, "Sticky sessions");
        sessions
            .peek(session_id)
            .filter(|b| b.bound_at.elapsed() < self.ttl)
            .map(|b| b.endpoint_id.clone())
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions, "Sticky sessions").len()
    }

    fn bound_endpoint(&self, session_id: &str, candidates: &PoolSnapshot) -> Option<Arc<Endpoint>> {
        let mut sessions = lock(&self.sessions, "Sticky sessions");
        let binding = sessions.get(session_id)?.clone();

        if binding.bound_at.elapsed() >= self.ttl {
            debug!("Sticky session '{}' expired", session_id);
            sessions.pop(session_id);
            return None;
        }

        match candidates.get(&binding.endpoint_id) {
            Some(endpoint) => Some(endpoint.clone()),
            None => {
                debug!(
                    "Sticky session '{}': endpoint '{}' no longer eligible, rebinding",
                    session_id, binding.endpoint_id
                );
                sessions.pop(session_id);
                None
            }
        }
    }
}

impl RotationStrategy for StickySessionStrategy {
    fn select(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<Arc<Endpoint>> {
        let Some(session_id) = context.session_id.as_deref() else {
            return self.inner.select(candidates, context);
        };

        if let Some(endpoint) = self.bound_endpoint(session_id, candidates) {
            return Ok(endpoint);
        }

        // The inner strategy runs without the session lock held.
        let chosen = self.inner.select(candidates, context)?;
        lock(&self.sessions, "Sticky sessions").put(
            session_id.to_string(),
            Binding {
                endpoint_id: chosen.id().clone(),
                bound_at: Instant::now(),
            },
        );
        debug!("Sticky session '{}' bound to '{}'", session_id, chosen.id());

        Ok(chosen)
    }

    fn filter_candidates(
        &self,
        candidates: &PoolSnapshot,
        context: &SelectionContext,
    ) -> Result<PoolSnapshot> {
        self.inner.filter_candidates(candidates, context)
    }

    fn record_result(&self, endpoint: &Endpoint, success: bool, latency: Duration) {
        self.inner.record_result(endpoint, success, latency);
        if success {
            return;
        }

        let mut sessions = lock(&self.sessions, "Sticky sessions");
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, b)| b.endpoint_id == *endpoint.id())
            .map(|(session, _)| session.clone())
            .collect();
        for session in stale {
            sessions.pop(&session);
        }
    }
}
