use std::sync::Arc;

/// Stable endpoint identifier (usually derived from the proxy URL).
pub type EndpointId = Arc<str>;
