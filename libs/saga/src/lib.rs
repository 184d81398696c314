//! Saga execution: compensable multi-step workflows.
//!
//! Two independent layers:
//!
//! - [`executor`]: runs an ordered sequence of steps forward, and on the
//!   first failure runs the completed steps' compensations in strict reverse
//!   order (LIFO), capturing per-compensation outcomes instead of aborting.
//! - [`routing`]: routes inbound messages to the saga instance they belong
//!   to, keyed by correlation id, and persists state through a repository
//!   with optimistic concurrency.

pub mod executor;
pub mod repository;
pub mod routing;
pub mod state;
pub mod step;

pub use executor::{CompensationOutcome, SagaExecutor, SagaReport, SagaStyle};
pub use repository::{InMemorySagaRepository, SagaRepository};
pub use routing::{SagaMessageHandler, SagaOutcome, SagaRouter, TypedSagaHandler};
pub use state::{SagaInstance, SagaStatus};
pub use step::{SagaStep, StepError};

use envelope::CodecError;
use uuid::Uuid;

/// Saga-layer error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga style {0:?} is not executable")]
    UnsupportedStyle(SagaStyle),

    #[error("saga execution cancelled")]
    Cancelled,

    #[error("saga handler already registered for {message_type} at {address}")]
    DuplicateRegistration { address: String, message_type: String },

    #[error("receive context has no destination address")]
    MissingDestination,

    #[error("stale saga version for {correlation_id}")]
    VersionConflict { correlation_id: Uuid },

    #[error("saga repository failure: {0}")]
    Repository(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("saga handler failed: {0}")]
    Handler(String),
}

impl SagaError {
    pub fn repository(msg: impl Into<String>) -> Self {
        SagaError::Repository(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        SagaError::Handler(msg.into())
    }
}
