//! The orchestrating rotator.
//!
//! Per logical request: `SELECT -> ATTEMPT -> (SUCCESS | RETRYABLE_FAILURE
//! -> SELECT | TERMINAL_FAILURE)`. Selection works on a pool snapshot
//! filtered by health and circuit state; the chosen endpoint then has to
//! pass its breaker's admission gate. No lock is held across the transport
//! call or a backoff sleep.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::RotatorConfig;
use crate::circuit::{
    CircuitBreakers, CircuitPersister, CircuitSnapshot, CircuitStateStore, FanoutSink,
    TransitionSink,
};
use crate::errors::{AttemptFailure, RetryClass, RotatorError};
use crate::models::{
    Endpoint, EndpointId, EndpointSnapshot, HealthStatus, ProxyRequest, ProxyResponse,
    SelectionContext,
};
use crate::pool::{EndpointPool, PoolSnapshot};
use crate::retry::{
    select_failover, MetricsSink, RetryAttempt, RetryMetrics, RetryMetricsSummary, RetryPolicy,
};
use crate::strategy::{
    BuildContext, RotationStrategy, StrategyConfig, StrategyFactory, StrategyRegistry,
};
use crate::sync::{read, write};
use crate::transport::Transport;
use crate::Result;

/// A successful request.
#[derive(Clone, Debug)]
pub struct Execution {
    pub response: ProxyResponse,
    /// Endpoint that delivered the response
    pub endpoint_id: EndpointId,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
    pub request_id: Uuid,
}

/// The strategy instance currently in use, with what it was built from.
struct ActiveStrategy {
    name: String,
    config: StrategyConfig,
    strategy: Arc<dyn RotationStrategy>,
}

/// What happened to one attempt.
enum AttemptResult {
    Delivered(ProxyResponse),
    Failed(AttemptFailure),
    DeadlineExceeded,
    Cancelled,
}

/// Resilient selection engine.
pub struct Rotator {
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    registry: Arc<StrategyRegistry>,
    active: RwLock<Arc<ActiveStrategy>>,
    default_policy: RetryPolicy,
    breakers: CircuitBreakers,
    metrics: Arc<RetryMetrics>,
    state_store: Option<Arc<dyn CircuitStateStore>>,
    persister: Option<Arc<CircuitPersister>>,
    config: RotatorConfig,
}

/// Builder for a [`Rotator`].
pub struct RotatorBuilder {
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    config: RotatorConfig,
    registry: Option<Arc<StrategyRegistry>>,
    state_store: Option<Arc<dyn CircuitStateStore>>,
}

impl RotatorBuilder {
    pub fn config(mut self, config: RotatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom registry instead of the built-in catalog.
    pub fn registry(mut self, registry: Arc<StrategyRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Store used when `persistence.enabled` is set.
    pub fn state_store(mut self, store: Arc<dyn CircuitStateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Validate the configuration and build the rotator.
    ///
    /// Fails with `StrategyNotFound` for an unknown strategy name and with
    /// `InvalidConfiguration` for out-of-range settings, or when persistence
    /// is enabled without a store or outside a tokio runtime.
    pub fn build(self) -> Result<Rotator> {
        let config = self.config;
        config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StrategyRegistry::with_builtins()));
        let strategy = registry.build(&config.strategy, &config.strategy_config)?;

        let metrics = Arc::new(RetryMetrics::with_config(config.metrics.clone()));
        let mut sinks = FanoutSink::new(vec![Arc::clone(&metrics) as Arc<dyn TransitionSink>]);

        let persister = if config.persistence.enabled {
            let store = self.state_store.clone().ok_or_else(|| {
                RotatorError::invalid("persistence is enabled but no circuit state store was given")
            })?;
            let persister = Arc::new(CircuitPersister::spawn(
                store,
                config.persistence.queue_capacity,
            )?);
            sinks.push(Arc::clone(&persister) as Arc<dyn TransitionSink>);
            Some(persister)
        } else {
            if self.state_store.is_some() {
                warn!("Rotator: circuit state store given but persistence is disabled; ignoring it");
            }
            None
        };

        let breakers = CircuitBreakers::with_overrides(
            config.circuit_breaker.clone(),
            config.circuit_overrides.clone(),
            Arc::new(sinks),
        )?;
        breakers.sync(&self.pool.snapshot());

        info!(
            "Rotator: built with strategy '{}' over {} endpoints (persistence {})",
            config.strategy,
            self.pool.len(),
            if persister.is_some() { "on" } else { "off" }
        );

        Ok(Rotator {
            pool: self.pool,
            transport: self.transport,
            registry,
            active: RwLock::new(Arc::new(ActiveStrategy {
                name: config.strategy.clone(),
                config: config.strategy_config.clone(),
                strategy,
            })),
            default_policy: config.retry_policy.clone(),
            breakers,
            metrics,
            state_store: if persister.is_some() { self.state_store } else { None },
            persister,
            config,
        })
    }
}

impl Rotator {
    /// Rotator with the built-in strategy catalog.
    pub fn new(
        pool: Arc<EndpointPool>,
        transport: Arc<dyn Transport>,
        config: RotatorConfig,
    ) -> Result<Self> {
        Self::builder(pool, transport).config(config).build()
    }

    /// Rotator resolving strategies from `registry`.
    pub fn with_registry(
        pool: Arc<EndpointPool>,
        transport: Arc<dyn Transport>,
        config: RotatorConfig,
        registry: Arc<StrategyRegistry>,
    ) -> Result<Self> {
        Self::builder(pool, transport)
            .config(config)
            .registry(registry)
            .build()
    }

    pub fn builder(pool: Arc<EndpointPool>, transport: Arc<dyn Transport>) -> RotatorBuilder {
        RotatorBuilder {
            pool,
            transport,
            config: RotatorConfig::default(),
            registry: None,
            state_store: None,
        }
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<RetryMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }

    // ---- strategies -------------------------------------------------------

    fn current_strategy(&self) -> Arc<ActiveStrategy> {
        Arc::clone(&read(&self.active, "Active strategy"))
    }

    pub fn active_strategy_name(&self) -> String {
        self.current_strategy().name.clone()
    }

    /// Register (or replace) a strategy factory on this rotator's registry.
    pub fn register_strategy<F>(&self, name: impl Into<String>, factory: F) -> Option<StrategyFactory>
    where
        F: Fn(&BuildContext<'_>) -> Result<Arc<dyn RotationStrategy>> + Send + Sync + 'static,
    {
        self.registry.register(name, factory)
    }

    pub fn resolve_strategy(&self, name: &str) -> Result<StrategyFactory> {
        self.registry.resolve(name)
    }

    /// Build `name` from `config` and make it the active strategy.
    ///
    /// Requests already running keep the instance they started with.
    pub fn reconfigure_strategy(&self, name: &str, config: StrategyConfig) -> Result<()> {
        config.validate()?;
        let strategy = self.registry.build(name, &config)?;

        let previous = std::mem::replace(
            &mut *write(&self.active, "Active strategy"),
            Arc::new(ActiveStrategy {
                name: name.to_string(),
                config,
                strategy,
            }),
        );

        info!(
            "Rotator: strategy switched from '{}' to '{}'",
            previous.name, name
        );
        Ok(())
    }

    /// Configuration of the active strategy.
    pub fn strategy_config(&self) -> StrategyConfig {
        self.current_strategy().config.clone()
    }

    // ---- monitoring -------------------------------------------------------

    /// Every endpoint's breaker, keyed by endpoint id.
    pub fn get_circuit_breaker_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers.sync(&self.pool.snapshot());
        self.breakers.states()
    }

    /// Force an endpoint's circuit closed. Returns `false` for unknown ids.
    pub fn reset_circuit_breaker(&self, endpoint_id: &str) -> bool {
        match self.pool.get(endpoint_id) {
            Some(endpoint) => {
                self.breakers.breaker_for(endpoint.id()).reset();
                true
            }
            None => self.breakers.reset(endpoint_id),
        }
    }

    pub fn get_retry_metrics(&self, window: Option<Duration>) -> RetryMetricsSummary {
        self.metrics.summary(window)
    }

    pub fn endpoint_snapshots(&self) -> Vec<EndpointSnapshot> {
        self.pool
            .snapshot()
            .endpoints()
            .iter()
            .map(|e| e.snapshot())
            .collect()
    }

    /// Start the periodic metrics rollup on the current runtime.
    pub fn spawn_metrics_rollup(
        &self,
        sink: Option<Arc<dyn MetricsSink>>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        self.metrics
            .spawn_rollup_task(self.config.metrics.rollup_interval, sink, cancel)
    }

    /// Load persisted circuit state for every pool member.
    ///
    /// Does nothing unless persistence is enabled. Load failures are logged
    /// and leave the breaker `CLOSED`. Returns the number of breakers
    /// restored.
    pub async fn restore_circuit_states(&self) -> usize {
        let Some(store) = &self.state_store else {
            debug!("Rotator: persistence disabled, all circuits start closed");
            return 0;
        };

        let mut restored = 0;
        for endpoint in self.pool.snapshot().endpoints() {
            match store.load_state(endpoint.id()).await {
                Ok(Some(state)) => {
                    self.breakers.breaker_for(endpoint.id()).restore(&state);
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Rotator: could not load circuit state for '{}', starting closed: {}",
                    endpoint.id(),
                    e
                ),
            }
        }

        info!("Rotator: restored {} circuit states", restored);
        restored
    }

    /// Pending and dropped persistence writes, when persistence is enabled.
    pub fn persistence_backlog(&self) -> Option<(usize, u64)> {
        self.persister.as_ref().map(|p| (p.pending(), p.dropped()))
    }

    // ---- selection --------------------------------------------------------

    /// Candidates for the next attempt.
    ///
    /// Drops unhealthy endpoints, endpoints whose circuit does not admit
    /// requests and those in `skip`, then applies the strategy's own
    /// restriction. When some remaining candidate is not listed in the
    /// context's `failed_proxy_ids`, only those untried candidates are
    /// returned. Fails when nothing survives.
    fn candidates(
        &self,
        strategy: &dyn RotationStrategy,
        context: &SelectionContext,
        skip: &[EndpointId],
    ) -> Result<PoolSnapshot> {
        let eligible = self.pool.snapshot().filter(|e| {
            e.health() != HealthStatus::Unhealthy
                && !skip.iter().any(|id| id == e.id())
                && self.breakers.is_selectable(e.id())
        });
        if eligible.is_empty() {
            return Err(self.nothing_eligible());
        }

        let restricted = strategy.filter_candidates(&eligible, context)?;
        if restricted.is_empty() {
            return Err(RotatorError::pool_unavailable(
                "strategy restriction left no eligible endpoint",
            ));
        }

        let untried = restricted.filter(|e| !context.has_tried(e.id()));
        if untried.is_empty() {
            Ok(restricted)
        } else {
            Ok(untried)
        }
    }

    /// Select an endpoint without sending anything.
    pub fn select(&self, context: &SelectionContext) -> Result<Arc<Endpoint>> {
        let active = self.current_strategy();
        let candidates = self.candidates(active.strategy.as_ref(), context, &[])?;
        active.strategy.select(&candidates, context)
    }

    fn nothing_eligible(&self) -> RotatorError {
        if self.pool.is_empty() {
            RotatorError::pool_unavailable("endpoint pool is empty")
        } else {
            RotatorError::pool_unavailable(
                "no eligible endpoint (all circuits open, unhealthy or already tried)",
            )
        }
    }

    /// First attempts go through the active strategy; retries rank the
    /// same restricted candidates by failover score.
    fn choose(
        &self,
        active: &ActiveStrategy,
        policy: &RetryPolicy,
        context: &SelectionContext,
        skip: &[EndpointId],
        retrying: bool,
    ) -> Result<Arc<Endpoint>> {
        let candidates = self.candidates(active.strategy.as_ref(), context, skip)?;

        if retrying {
            select_failover(&candidates, context, &policy.scoring)
                .ok_or_else(|| self.nothing_eligible())
        } else {
            active.strategy.select(&candidates, context)
        }
    }

    // ---- execution --------------------------------------------------------

    /// Send `request` through the pool with retries and failover.
    ///
    /// `policy` overrides the rotator's default retry policy for this call.
    pub async fn select_and_execute(
        &self,
        request: &ProxyRequest,
        policy: Option<&RetryPolicy>,
        context: Option<&SelectionContext>,
    ) -> Result<Execution> {
        self.select_and_execute_with_cancel(request, policy, context, CancellationToken::new())
            .await
    }

    /// [`select_and_execute`](Self::select_and_execute) that stops promptly
    /// when `cancel` fires. An in-flight attempt is dropped and not counted
    /// against its endpoint.
    pub async fn select_and_execute_with_cancel(
        &self,
        request: &ProxyRequest,
        policy: Option<&RetryPolicy>,
        context: Option<&SelectionContext>,
        cancel: CancellationToken,
    ) -> Result<Execution> {
        let policy = match policy {
            Some(policy) => {
                policy.validate()?;
                policy
            }
            None => &self.default_policy,
        };

        self.breakers.sync_if_changed(&self.pool.snapshot());
        let active = self.current_strategy();
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = policy.timeout.map(|timeout| started + timeout);
        let idempotent = request.is_idempotent();

        let mut context = context.cloned().unwrap_or_default();
        let mut skip: Vec<EndpointId> = Vec::new();
        let mut attempts: u32 = 0;
        let mut last = LastFailure::default();

        let result = loop {
            if cancel.is_cancelled() {
                break Err(cancelled(attempts, &last));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Err(timed_out(started, attempts, &last));
            }

            // SELECT
            let endpoint = match self.choose(&active, policy, &context, &skip, attempts > 0) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    if let (Some(endpoint_id), Some(failure)) = (&last.endpoint, &last.failure) {
                        warn!(
                            "Rotator: request {} has no endpoint left after {} attempt(s) (last: {} on '{}')",
                            request_id, attempts, failure, endpoint_id
                        );
                    }
                    break Err(err.with_attempt_trail(
                        attempts,
                        last.endpoint.clone(),
                        last.failure.clone(),
                    ));
                }
            };

            if !self.pool.contains(endpoint.id()) {
                debug!("Rotator: '{}' left the pool during selection", endpoint.id());
                skip.push(endpoint.id().clone());
                continue;
            }

            let breaker = self.breakers.breaker_for(endpoint.id());
            if !breaker.should_attempt_request() {
                debug!("Rotator: '{}' denied by its circuit, reselecting", endpoint.id());
                skip.push(endpoint.id().clone());
                continue;
            }

            // ATTEMPT
            attempts += 1;
            context.mark_tried(endpoint.id());
            last.endpoint = Some(endpoint.id().clone());
            debug!(
                "Rotator: request {} attempt {}/{} via '{}'",
                request_id,
                attempts,
                policy.max_attempts,
                endpoint.id()
            );

            endpoint.begin_request();
            let attempt_started = Instant::now();
            let outcome = self.attempt(&endpoint, request, deadline, &cancel).await;
            let latency = attempt_started.elapsed();

            let failure = match outcome {
                AttemptResult::Delivered(response) if response.is_success() => {
                    endpoint.record_outcome(true, latency);
                    active.strategy.record_result(&endpoint, true, latency);
                    breaker.record_success();
                    self.metrics.record_attempt(RetryAttempt::success(
                        request_id,
                        endpoint.id().clone(),
                        attempts,
                        latency,
                    ));

                    break Ok(Execution {
                        response,
                        endpoint_id: endpoint.id().clone(),
                        attempts,
                        elapsed: started.elapsed(),
                        request_id,
                    });
                }
                AttemptResult::Delivered(response) => AttemptFailure::Status(response.status),
                AttemptResult::Failed(failure) => failure,
                AttemptResult::DeadlineExceeded => {
                    endpoint.abandon_request();
                    breaker.release_probe();
                    break Err(timed_out(started, attempts, &last));
                }
                AttemptResult::Cancelled => {
                    endpoint.abandon_request();
                    breaker.release_probe();
                    break Err(cancelled(attempts, &last));
                }
            };

            let class = failure.retry_class(policy, idempotent);
            // A response outside the retry set still proves the endpoint works.
            let endpoint_ok = !class.penalises_endpoint();
            endpoint.record_outcome(endpoint_ok, latency);
            active.strategy.record_result(&endpoint, endpoint_ok, latency);
            if endpoint_ok {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
            self.metrics.record_attempt(RetryAttempt::failure(
                request_id,
                endpoint.id().clone(),
                attempts,
                &failure,
                latency,
            ));

            let endpoint_id = endpoint.id().clone();
            match class {
                RetryClass::Never => {
                    break Err(RotatorError::NonRetryableFailure {
                        endpoint: endpoint_id,
                        attempts,
                        failure,
                    });
                }
                RetryClass::AbortWithPenalty => {
                    // Retryable in kind, but the request may not be replayed.
                    let retryable_in_kind = failure.retry_class(policy, true).allows_retry();
                    break Err(if retryable_in_kind {
                        RotatorError::RetryableTransportFailure {
                            endpoint: endpoint_id,
                            attempts,
                            failure,
                        }
                    } else {
                        RotatorError::NonRetryableFailure {
                            endpoint: endpoint_id,
                            attempts,
                            failure,
                        }
                    });
                }
                RetryClass::FailoverWithPenalty => {
                    if attempts >= policy.max_attempts {
                        break Err(RotatorError::RetryBudgetExhausted {
                            attempts,
                            last_endpoint: endpoint_id,
                            last_failure: failure,
                        });
                    }

                    debug!(
                        "Rotator: request {} attempt {} failed on '{}': {}",
                        request_id, attempts, endpoint_id, failure
                    );
                    last.failure = Some(failure);

                    let delay = policy.delay(attempts);
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        break Err(timed_out(started, attempts, &last));
                    }
                    if !delay.is_zero() {
                        debug!("Rotator: backing off {:?} before attempt {}", delay, attempts + 1);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break Err(cancelled(attempts, &last)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };

        self.metrics.record_request(attempts, result.is_ok());
        match &result {
            Ok(execution) => debug!(
                "Rotator: request {} succeeded via '{}' after {} attempt(s) in {:?}",
                request_id, execution.endpoint_id, execution.attempts, execution.elapsed
            ),
            Err(err) => info!("Rotator: request {} failed: {}", request_id, err),
        }
        result
    }

    /// One transport call, bounded by the request deadline and the
    /// cancellation token.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let call = async {
            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, self.transport.execute(endpoint, request))
                        .await
                        .ok()
                }
                None => Some(self.transport.execute(endpoint, request).await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptResult::Cancelled,
            outcome = call => match outcome {
                None => AttemptResult::DeadlineExceeded,
                Some(Ok(response)) => AttemptResult::Delivered(response),
                Some(Err(err)) => AttemptResult::Failed(AttemptFailure::Transport(err)),
            },
        }
    }
}

/// Most recent endpoint tried and most recent completed failure.
#[derive(Default)]
struct LastFailure {
    endpoint: Option<EndpointId>,
    failure: Option<AttemptFailure>,
}

fn timed_out(started: Instant, attempts: u32, last: &LastFailure) -> RotatorError {
    RotatorError::RequestTimeoutExceeded {
        elapsed: started.elapsed(),
        attempts,
        last_endpoint: last.endpoint.clone(),
        last_failure: last.failure.clone(),
    }
}

fn cancelled(attempts: u32, last: &LastFailure) -> RotatorError {
    RotatorError::Cancelled {
        attempts,
        last_endpoint: last.endpoint.clone(),
    }
}
