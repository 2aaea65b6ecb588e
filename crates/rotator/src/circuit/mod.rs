//! Circuit breakers, one per endpoint.
//!
//! This module provides:
//! - [`CircuitBreaker`]: The three-state machine guarding a single endpoint
//! - [`CircuitBreakers`]: The per-endpoint map owned by the rotator
//! - [`CircuitTransition`] events and the [`TransitionSink`]s that receive them
//! - [`CircuitPersister`]: Optional best-effort persistence of state

mod breaker;
mod events;
mod persistence;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use events::{
    CircuitTransition, CollectingSink, FanoutSink, NoOpTransitionSink, TransitionReason,
    TransitionSink,
};
pub use persistence::{
    CircuitPersister, CircuitStateStore, MemoryCircuitStore, PersistedCircuitState, StoreError,
    DEFAULT_QUEUE_CAPACITY,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::info;

use crate::models::EndpointId;
use crate::pool::PoolSnapshot;
use crate::Result;

/// The breaker map.
///
/// Breakers are created on first touch with the endpoint's override config
/// if one exists, the defaults otherwise. The map itself is sharded, so
/// looking up one endpoint's breaker never contends with another's.
/// Breakers of endpoints that left the pool are dropped by [`sync`](Self::sync).
pub struct CircuitBreakers {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<EndpointId, Arc<CircuitBreaker>>,
    sink: Arc<dyn TransitionSink>,
    /// Pool generation + 1 of the newest snapshot synced; 0 before any sync
    synced_generation: AtomicU64,
}

impl CircuitBreakers {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: DashMap::new(),
            sink: Arc::new(NoOpTransitionSink),
            synced_generation: AtomicU64::new(0),
        }
    }

    /// Breakers with per-endpoint overrides, reporting transitions to `sink`.
    pub fn with_overrides(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
        sink: Arc<dyn TransitionSink>,
    ) -> Result<Self> {
        defaults.validate()?;
        for config in overrides.values() {
            config.validate()?;
        }

        Ok(Self {
            defaults,
            overrides,
            breakers: DashMap::new(),
            sink,
            synced_generation: AtomicU64::new(0),
        })
    }

    /// Configuration a breaker for `endpoint_id` is (or will be) built with.
    pub fn config_for(&self, endpoint_id: &str) -> &CircuitBreakerConfig {
        self.overrides.get(endpoint_id).unwrap_or(&self.defaults)
    }

    /// The breaker for `endpoint_id`, created if this is its first use.
    pub fn breaker_for(&self, endpoint_id: &EndpointId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(endpoint_id) {
            return Arc::clone(existing.value());
        }

        self.breakers
            .entry(endpoint_id.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_sink(
                    endpoint_id.clone(),
                    self.config_for(endpoint_id).clone(),
                    Arc::clone(&self.sink),
                ))
            })
            .value()
            .clone()
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(endpoint_id).map(|b| Arc::clone(b.value()))
    }

    /// Make sure every endpoint in `snapshot` has a breaker.
    pub fn ensure(&self, snapshot: &PoolSnapshot) {
        for endpoint in snapshot.endpoints() {
            if !self.breakers.contains_key(endpoint.id()) {
                self.breaker_for(endpoint.id());
            }
        }
    }

    /// Bring the map in line with `snapshot`: create breakers for new
    /// members and drop those of endpoints no longer in the pool.
    ///
    /// A snapshot older than one already synced is ignored. Returns the
    /// number of breakers dropped.
    pub fn sync(&self, snapshot: &PoolSnapshot) -> usize {
        let marker = snapshot.generation().saturating_add(1);
        let newest = self.synced_generation.fetch_max(marker, Ordering::AcqRel);
        if newest > marker {
            return 0;
        }

        self.ensure(snapshot);
        let before = self.breakers.len();
        self.breakers.retain(|id, _| snapshot.contains(id));
        let dropped = before.saturating_sub(self.breakers.len());
        if dropped > 0 {
            info!(
                "Circuit breakers: dropped {} breaker(s) for endpoints removed from the pool",
                dropped
            );
        }
        dropped
    }

    /// [`sync`](Self::sync) only when `snapshot` is newer than the last
    /// synced generation.
    pub fn sync_if_changed(&self, snapshot: &PoolSnapshot) -> usize {
        let marker = snapshot.generation().saturating_add(1);
        if self.synced_generation.load(Ordering::Acquire) >= marker {
            return 0;
        }
        self.sync(snapshot)
    }

    /// Drop one endpoint's breaker. Returns `false` if there was none.
    pub fn forget(&self, endpoint_id: &str) -> bool {
        self.breakers.remove(endpoint_id).is_some()
    }

    /// Side-effect-free eligibility check; unknown endpoints are closed.
    pub fn is_selectable(&self, endpoint_id: &str) -> bool {
        self.get(endpoint_id).map_or(true, |b| b.is_selectable())
    }

    /// Force one breaker closed. Returns `false` if the endpoint is unknown.
    pub fn reset(&self, endpoint_id: &str) -> bool {
        match self.get(endpoint_id) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
        info!("Circuit breakers: all {} circuits reset", self.breakers.len());
    }

    /// Snapshot of every breaker, keyed by endpoint id.
    pub fn states(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
