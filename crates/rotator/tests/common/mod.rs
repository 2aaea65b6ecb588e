//! Shared fixtures for the rotator integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use egress_rotator::{
    Endpoint, EndpointPool, ProxyRequest, ProxyResponse, RetryPolicy, TransportError,
    TransportErrorKind,
};
use egress_rotator::transport::Transport;
use egress_rotator::BackoffStrategy;

/// What a scripted endpoint does with a request.
#[derive(Clone, Debug)]
pub enum Reply {
    Status(u16),
    Fail(TransportErrorKind),
    /// Answer with the status after sleeping on the tokio clock.
    Slow(Duration, u16),
}

/// In-memory transport answering per endpoint id from a script.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, endpoint_id: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), reply);
    }

    pub fn calls(&self, endpoint_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        _request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(endpoint.id().to_string())
            .or_default() += 1;

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(endpoint.id().as_ref())
            .cloned()
            .unwrap_or(Reply::Status(200));

        match reply {
            Reply::Status(status) => Ok(ProxyResponse::new(status)),
            Reply::Fail(kind) => Err(TransportError::new(kind, "scripted failure")),
            Reply::Slow(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(ProxyResponse::new(status))
            }
        }
    }
}

pub fn pool_of(ids: &[&str]) -> Arc<EndpointPool> {
    Arc::new(EndpointPool::from_endpoints(
        ids.iter()
            .map(|id| Endpoint::new(*id, format!("http://{id}.proxy.test:3128"))),
    ))
}

/// `attempts` tries with a 1ms fixed backoff and no jitter.
pub fn quick_policy(attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(attempts)
        .with_backoff(BackoffStrategy::Fixed, Duration::from_millis(1))
        .with_jitter(false)
}
