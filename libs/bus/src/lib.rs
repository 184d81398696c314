//! The bus facade: send, publish, request/response, and scheduling over
//! interchangeable transports.
//!
//! A [`Bus`] owns a logical address, a set of transport hosts, and a
//! serializer. Producers call [`Bus::publish`] or obtain a [`SendEndpoint`];
//! consumers bind receive endpoints; request/response is layered on top via
//! [`RequestClient`]. Delivery guarantees beyond a single attempt come from
//! the `outbox` crate, which shares the same host registry.

pub mod bus;
pub mod config;
pub mod request;
pub mod scheduler;

pub use bus::{Bus, BusBuilder, SendEndpoint};
pub use config::{BusConfig, OutboxSection, SchedulerSection};
pub use request::RequestClient;
pub use scheduler::{
    InMemoryScheduledStore, InProcessScheduler, PersistedScheduler, PersistedSchedulerConfig,
    ScheduledMessageStore, ScheduledRecord,
};

use envelope::CodecError;
use std::time::Duration;
use transport::TransportError;

/// Bus-layer error taxonomy. Configuration errors fail fast and are never
/// retried; transport errors may be transient.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no response within {timeout:?}")]
    RequestTimeout { timeout: Duration },

    #[error("store failure: {0}")]
    Store(String),
}

impl BusError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        BusError::Configuration(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        BusError::Store(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::RequestTimeout { .. })
    }
}
