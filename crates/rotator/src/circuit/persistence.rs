//! Best-effort persistence of circuit state.
//!
//! The request path never waits on the store: transitions are pushed onto a
//! bounded in-memory queue and a background task writes them out. When the
//! queue is full the oldest pending write is dropped, since a newer state
//! for the same endpoint supersedes it anyway. Transitions are published
//! after the breaker lock is released, so two of them can reach the queue
//! out of order; the writer skips any state older than one it already saved
//! for that endpoint.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use super::events::{CircuitTransition, TransitionSink};
use super::CircuitState;
use crate::errors::RotatorError;
use crate::sync::lock;
use crate::Result;

/// Default number of pending writes held before the oldest is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Error reported by a [`CircuitStateStore`].
#[derive(Debug, Error)]
#[error("circuit state store error: {0}")]
pub struct StoreError(pub String);

/// Circuit state as written to a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCircuitState {
    pub endpoint_id: String,
    pub state: CircuitState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_test_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Sequence of the transition that produced this state; 0 when unknown
    #[serde(default)]
    pub sequence: u64,
}

impl PersistedCircuitState {
    /// Whether this state must not overwrite one saved with `saved_sequence`.
    fn is_superseded_by(&self, saved_sequence: u64) -> bool {
        self.sequence != 0 && self.sequence <= saved_sequence
    }
}

impl From<&CircuitTransition> for PersistedCircuitState {
    fn from(transition: &CircuitTransition) -> Self {
        Self {
            endpoint_id: transition.endpoint_id.to_string(),
            state: transition.to,
            next_test_at: transition.next_test_at,
            updated_at: transition.at,
            sequence: transition.sequence,
        }
    }
}

/// External store for circuit state.
///
/// `load_state` is only called at startup.
#[async_trait]
pub trait CircuitStateStore: Send + Sync {
    async fn save_state(&self, state: PersistedCircuitState) -> std::result::Result<(), StoreError>;

    async fn load_state(
        &self,
        endpoint_id: &str,
    ) -> std::result::Result<Option<PersistedCircuitState>, StoreError>;
}

/// Process-local store, mainly for tests and single-process deployments
/// that only want state to survive a rotator rebuild.
#[derive(Default)]
pub struct MemoryCircuitStore {
    states: DashMap<String, PersistedCircuitState>,
}

impl MemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint_id: &str) -> Option<PersistedCircuitState> {
        self.states.get(endpoint_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl CircuitStateStore for MemoryCircuitStore {
    async fn save_state(&self, state: PersistedCircuitState) -> std::result::Result<(), StoreError> {
        self.states.insert(state.endpoint_id.clone(), state);
        Ok(())
    }

    async fn load_state(
        &self,
        endpoint_id: &str,
    ) -> std::result::Result<Option<PersistedCircuitState>, StoreError> {
        Ok(self.get(endpoint_id))
    }
}

struct PersistQueue {
    pending: Mutex<VecDeque<PersistedCircuitState>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl PersistQueue {
    fn pop(&self) -> Option<PersistedCircuitState> {
        lock(&self.pending, "Persistence queue").pop_front()
    }
}

/// Handle to the background writer.
///
/// Dropping the handle stops the writer once the queue has drained.
pub struct CircuitPersister {
    queue: Arc<PersistQueue>,
}

impl CircuitPersister {
    /// Spawn the writer task on the current tokio runtime.
    ///
    /// Fails with `InvalidConfiguration` when called outside a runtime or
    /// with a zero capacity.
    pub fn spawn(store: Arc<dyn CircuitStateStore>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RotatorError::invalid("persistence queueCapacity must be at least 1"));
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            RotatorError::invalid("circuit persistence requires a running tokio runtime")
        })?;

        let queue = Arc::new(PersistQueue {
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let worker = Arc::clone(&queue);
        handle.spawn(async move {
            let mut saved: HashMap<String, u64> = HashMap::new();
            loop {
                match worker.pop() {
                    Some(state) => {
                        if saved
                            .get(&state.endpoint_id)
                            .is_some_and(|seq| state.is_superseded_by(*seq))
                        {
                            debug!(
                                "Circuit persistence: skipped stale state #{} for '{}'",
                                state.sequence, state.endpoint_id
                            );
                            continue;
                        }
                        let endpoint_id = state.endpoint_id.clone();
                        let sequence = state.sequence;
                        match store.save_state(state).await {
                            Ok(()) => {
                                saved.insert(endpoint_id, sequence);
                            }
                            Err(e) => {
                                warn!("Circuit persistence: failed to save '{}': {}", endpoint_id, e);
                            }
                        }
                    }
                    None if worker.closed.load(Ordering::Acquire) => break,
                    None => worker.notify.notified().await,
                }
            }
            debug!("Circuit persistence: writer stopped");
        });

        Ok(Self { queue })
    }

    /// Queue a write without waiting for it.
    pub fn enqueue(&self, state: PersistedCircuitState) {
        {
            let mut pending = lock(&self.queue.pending, "Persistence queue");
            if pending.len() >= self.queue.capacity {
                if let Some(oldest) = pending.pop_front() {
                    self.queue.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Circuit persistence: queue full, dropped pending write for '{}'",
                        oldest.endpoint_id
                    );
                }
            }
            pending.push_back(state);
        }
        self.queue.notify.notify_one();
    }

    /// Writes dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Writes waiting for the background task.
    pub fn pending(&self) -> usize {
        lock(&self.queue.pending, "Persistence queue").len()
    }
}

impl TransitionSink for CircuitPersister {
    fn emit(&self, transition: &CircuitTransition) {
        self.enqueue(PersistedCircuitState::from(transition));
    }
}

impl Drop for CircuitPersister {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state(id: &str, state: CircuitState) -> PersistedCircuitState {
        PersistedCircuitState {
            endpoint_id: id.to_string(),
            state,
            next_test_at: None,
            updated_at: Utc::now(),
            sequence: 0,
        }
    }

    fn sequenced(id: &str, state_value: CircuitState, sequence: u64) -> PersistedCircuitState {
        PersistedCircuitState {
            sequence,
            ..state(id, state_value)
        }
    }

    /// Store that blocks every save until released.
    struct GatedStore {
        gate: Notify,
        inner: MemoryCircuitStore,
    }

    #[async_trait]
    impl CircuitStateStore for GatedStore {
        async fn save_state(
            &self,
            state: PersistedCircuitState,
        ) -> std::result::Result<(), StoreError> {
            self.gate.notified().await;
            self.inner.save_state(state).await
        }

        async fn load_state(
            &self,
            endpoint_id: &str,
        ) -> std::result::Result<Option<PersistedCircuitState>, StoreError> {
            self.inner.load_state(endpoint_id).await
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CircuitStateStore for FailingStore {
        async fn save_state(
            &self,
            _state: PersistedCircuitState,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError("disk full".to_string()))
        }

        async fn load_state(
            &self,
            _endpoint_id: &str,
        ) -> std::result::Result<Option<PersistedCircuitState>, StoreError> {
            Err(StoreError("unreachable".to_string()))
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_writes_reach_store() {
        let store = Arc::new(MemoryCircuitStore::new());
        let persister = CircuitPersister::spawn(store.clone(), 8).unwrap();

        persister.enqueue(state("a", CircuitState::Open));
        persister.enqueue(state("b", CircuitState::Closed));

        wait_until(|| store.len() == 2).await;
        assert_eq!(store.get("a").map(|s| s.state), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let store = Arc::new(GatedStore {
            gate: Notify::new(),
            inner: MemoryCircuitStore::new(),
        });
        let persister = CircuitPersister::spawn(store.clone(), 2).unwrap();

        // The writer takes the first item and blocks on the gate.
        persister.enqueue(state("first", CircuitState::Open));
        wait_until(|| persister.pending() == 0).await;

        persister.enqueue(state("a", CircuitState::Open));
        persister.enqueue(state("b", CircuitState::Open));
        persister.enqueue(state("c", CircuitState::Open));

        assert_eq!(persister.dropped(), 1);
        assert_eq!(persister.pending(), 2);

        for _ in 0..200 {
            if store.inner.len() == 3 {
                break;
            }
            store.gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.inner.len(), 3);
        assert!(store.inner.get("a").is_none());
        assert!(store.inner.get("c").is_some());
    }

    #[tokio::test]
    async fn test_out_of_order_states_keep_newest() {
        let store = Arc::new(MemoryCircuitStore::new());
        let persister = CircuitPersister::spawn(store.clone(), 8).unwrap();

        persister.enqueue(sequenced("a", CircuitState::Closed, 7));
        persister.enqueue(sequenced("a", CircuitState::Open, 6));
        persister.enqueue(sequenced("b", CircuitState::Open, 5));

        wait_until(|| store.get("b").is_some()).await;
        let a = store.get("a").unwrap();
        assert_eq!(a.state, CircuitState::Closed);
        assert_eq!(a.sequence, 7);

        // A newer state still goes through.
        persister.enqueue(sequenced("a", CircuitState::HalfOpen, 8));
        wait_until(|| store.get("a").is_some_and(|s| s.sequence == 8)).await;
    }

    #[test]
    fn test_unsequenced_state_is_never_superseded() {
        assert!(!state("a", CircuitState::Open).is_superseded_by(9));
        assert!(sequenced("a", CircuitState::Open, 9).is_superseded_by(9));
        assert!(!sequenced("a", CircuitState::Open, 10).is_superseded_by(9));
    }

    #[tokio::test]
    async fn test_store_failure_is_absorbed() {
        let persister = CircuitPersister::spawn(Arc::new(FailingStore), 4).unwrap();
        persister.enqueue(state("a", CircuitState::Open));
        wait_until(|| persister.pending() == 0).await;
        assert_eq!(persister.dropped(), 0);
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let result = CircuitPersister::spawn(Arc::new(MemoryCircuitStore::new()), 4);
        assert!(matches!(result, Err(RotatorError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_persisted_state_round_trips_json() {
        let persisted = state("proxy-1", CircuitState::HalfOpen);
        let json = serde_json::to_string(&persisted).unwrap();
        assert!(json.contains("\"endpointId\":\"proxy-1\""));
        assert!(json.contains("\"HALF_OPEN\""));
    }
}
