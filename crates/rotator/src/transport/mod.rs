//! The transport collaborator: actually sending a request through an
//! endpoint.

mod http;

pub use http::ReqwestTransport;

use async_trait::async_trait;

use crate::errors::TransportError;
use crate::models::{Endpoint, ProxyRequest, ProxyResponse};

/// Sends one request through one endpoint.
///
/// Implementations report every response they receive as `Ok`, whatever its
/// status; the rotator decides what a status means. `Err` is reserved for
/// requests that produced no response.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use egress_rotator::transport::Transport;
///
/// struct Canned;
///
/// #[async_trait]
/// impl Transport for Canned {
///     async fn execute(&self, _: &Endpoint, _: &ProxyRequest) -> Result<ProxyResponse, TransportError> {
///         Ok(ProxyResponse::new(200))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        endpoint: &Endpoint,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse, TransportError>;
}
