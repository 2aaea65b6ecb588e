//! In-memory endpoint pool with snapshot reads.
//!
//! Membership is owned by an external pool manager (health monitor, config
//! loader). Selection never holds the pool lock: readers clone an `Arc` to an
//! immutable, insertion-ordered list and work on that. Every membership change
//! publishes a new list and bumps the pool generation, which strategies use to
//! invalidate cached per-pool state.

use std::sync::{Arc, RwLock};

use log::{debug, info};

use crate::models::{Endpoint, EndpointId, HealthStatus};
use crate::sync::{read, write};

/// Immutable view of the pool (or a filtered subset of it).
#[derive(Clone, Debug)]
pub struct PoolSnapshot {
    generation: u64,
    endpoints: Arc<[Arc<Endpoint>]>,
}

impl PoolSnapshot {
    pub fn new(generation: u64, endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self {
            generation,
            endpoints: endpoints.into(),
        }
    }

    /// Generation of the pool this view was taken from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Endpoints in pool insertion order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.id().as_ref() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// A subset of this view, preserving order and generation.
    pub fn filter<F>(&self, mut keep: F) -> PoolSnapshot
    where
        F: FnMut(&Endpoint) -> bool,
    {
        let endpoints: Vec<_> = self
            .endpoints
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect();

        PoolSnapshot::new(self.generation, endpoints)
    }
}

/// The shared endpoint pool.
pub struct EndpointPool {
    current: RwLock<PoolSnapshot>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(PoolSnapshot::new(0, Vec::new())),
        }
    }

    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let pool = Self::new();
        for endpoint in endpoints {
            pool.add(endpoint);
        }
        pool
    }

    /// Current membership. Cheap: clones one `Arc`.
    pub fn snapshot(&self) -> PoolSnapshot {
        read(&self.current, "Endpoint pool").clone()
    }

    pub fn generation(&self) -> u64 {
        read(&self.current, "Endpoint pool").generation
    }

    pub fn len(&self) -> usize {
        read(&self.current, "Endpoint pool").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        read(&self.current, "Endpoint pool").get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        read(&self.current, "Endpoint pool").contains(id)
    }

    /// Add an endpoint at the end of the pool.
    ///
    /// Returns `false` (and leaves the pool unchanged) if an endpoint with the
    /// same id is already a member.
    pub fn add(&self, endpoint: Endpoint) -> bool {
        self.add_shared(Arc::new(endpoint))
    }

    pub fn add_shared(&self, endpoint: Arc<Endpoint>) -> bool {
        let mut current = write(&self.current, "Endpoint pool");
        if current.contains(endpoint.id()) {
            debug!("Endpoint pool: '{}' already present", endpoint.id());
            return false;
        }

        let mut endpoints = current.endpoints.to_vec();
        info!("Endpoint pool: adding '{}'", endpoint.id());
        endpoints.push(endpoint);
        *current = PoolSnapshot::new(current.generation + 1, endpoints);
        true
    }

    /// Remove an endpoint. Snapshots already handed out keep it alive.
    pub fn remove(&self, id: &str) -> Option<Arc<Endpoint>> {
        let mut current = write(&self.current, "Endpoint pool");
        let position = current
            .endpoints
            .iter()
            .position(|e| e.id().as_ref() == id)?;

        let mut endpoints = current.endpoints.to_vec();
        let removed = endpoints.remove(position);
        info!("Endpoint pool: removed '{}'", id);
        *current = PoolSnapshot::new(current.generation + 1, endpoints);
        Some(removed)
    }

    /// Update an endpoint's health. Not a membership change.
    pub fn set_health(&self, id: &str, health: HealthStatus) -> bool {
        match self.get(id) {
            Some(endpoint) => {
                endpoint.set_health(health);
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        self.snapshot()
            .endpoints()
            .iter()
            .map(|e| e.id().clone())
            .collect()
    }
}

impl Default for EndpointPool {
    fn default() -> Self {
        Self::new()
    }
}
