use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use reqwest::{Client, Method, Proxy};

use super::Transport;
use crate::errors::{TransportError, TransportErrorKind, PROXY_AUTH_REQUIRED};
use crate::models::{Endpoint, EndpointId, ProxyRequest, ProxyResponse};

/// Default per-attempt HTTP timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport backed by `reqwest`, routing every request through the
/// endpoint's URL as an HTTP(S) proxy.
///
/// One client is built per endpoint and cached, so connection pooling
/// happens per proxy inside reqwest.
pub struct ReqwestTransport {
    clients: DashMap<EndpointId, Client>,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout,
        }
    }

    fn client_for(&self, endpoint: &Endpoint) -> Result<Client, TransportError> {
        if let Some(client) = self.clients.get(endpoint.id()) {
            return Ok(client.value().clone());
        }

        let proxy = Proxy::all(endpoint.url()).map_err(|e| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("invalid proxy url '{}': {}", endpoint.url(), e),
            )
        })?;
        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        debug!("Reqwest transport: built client for '{}'", endpoint.id());
        self.clients.insert(endpoint.id().clone(), client.clone());
        Ok(client)
    }

    /// Drop the cached client for an endpoint (e.g. after its URL changed).
    pub fn evict(&self, endpoint_id: &str) -> bool {
        self.clients.remove(endpoint_id).is_some()
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError> {
        let client = self.client_for(endpoint)?;

        let method = Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError::new(TransportErrorKind::Other, e.to_string()))?;

        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify(&e))?.to_vec();

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Map a reqwest failure onto the transport taxonomy.
fn classify(err: &reqwest::Error) -> TransportError {
    let kind = if err.status().is_some_and(|s| s.as_u16() == PROXY_AUTH_REQUIRED) {
        TransportErrorKind::ProxyAuth
    } else if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_body() || err.is_decode() {
        TransportErrorKind::Read
    } else if err.is_request() {
        TransportErrorKind::Write
    } else if err.is_builder() || err.is_redirect() {
        TransportErrorKind::Other
    } else {
        TransportErrorKind::Network
    };

    TransportError::new(kind, err.to_string())
}
