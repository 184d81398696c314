//! Transport-layer error taxonomy.
//!
//! Configuration problems (unknown host, duplicate endpoint) fail fast and
//! are never retried; delivery problems are recoverable and feed the retry
//! and circuit-breaker machinery.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("no transport host registered for {address}")]
    NoHostRegistered { address: String },

    #[error("no receive endpoint at {address}")]
    UnknownDestination { address: String },

    #[error("receive endpoint already registered at {address}")]
    EndpointAlreadyRegistered { address: String },

    #[error("endpoint {address} is not started")]
    NotStarted { address: String },

    #[error("circuit open, rejecting calls for {remaining:?}")]
    CircuitOpen { remaining: Duration },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("delivery cancelled before the handler ran")]
    Cancelled,

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl TransportError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        TransportError::ConnectionFailed(msg.into())
    }

    pub fn send_failed(msg: impl Into<String>) -> Self {
        TransportError::SendFailed(msg.into())
    }

    pub fn no_host(address: &url::Url) -> Self {
        TransportError::NoHostRegistered {
            address: address.to_string(),
        }
    }

    pub fn unknown_destination(address: &url::Url) -> Self {
        TransportError::UnknownDestination {
            address: address.to_string(),
        }
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        TransportError::Handler(msg.into())
    }

    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::SendFailed(_)
                | TransportError::CircuitOpen { .. }
                | TransportError::Handler(_)
                | TransportError::Cancelled
        )
    }

    /// Configuration errors are surfaced to the caller unretried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TransportError::NoHostRegistered { .. }
                | TransportError::EndpointAlreadyRegistered { .. }
                | TransportError::InvalidAddress(_)
        )
    }
}
