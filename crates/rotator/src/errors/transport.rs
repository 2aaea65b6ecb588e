//! Transport-level failure reported by a [`Transport`](crate::transport::Transport).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a transport fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Could not establish a connection to the endpoint.
    Connect,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Reading the response failed.
    Read,
    /// Writing the request failed.
    Write,
    /// The connection pool had no capacity left.
    PoolExhausted,
    /// Any other network-class fault (reset, DNS, TLS).
    Network,
    /// The endpoint rejected our credentials.
    ProxyAuth,
    /// Anything that is not a network fault, e.g. a malformed request.
    Other,
}

impl TransportErrorKind {
    /// Network-class faults are worth replaying on another endpoint.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Connect
                | Self::Timeout
                | Self::Read
                | Self::Write
                | Self::PoolExhausted
                | Self::Network
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Write => "write",
            Self::PoolExhausted => "pool_exhausted",
            Self::Network => "network",
            Self::ProxyAuth => "proxy_auth",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed transport call.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn proxy_auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ProxyAuth, message)
    }
}
