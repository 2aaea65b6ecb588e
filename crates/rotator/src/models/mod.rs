//! Rotator models
//!
//! This module contains the core data types:
//! - `types` - Type aliases for common identifiers (EndpointId)
//! - `endpoint` - Endpoint identity, tags, health and runtime statistics
//! - `context` - Per-request selection hints (SelectionContext)
//! - `request` - Request/response values handed to the transport

mod context;
mod endpoint;
mod request;
mod types;

pub use context::SelectionContext;
pub use endpoint::{
    Endpoint, EndpointSnapshot, HealthStatus, LatencyPercentiles, DEFAULT_EMA_ALPHA,
};
pub use request::{HttpMethod, ProxyRequest, ProxyResponse};
pub use types::EndpointId;
