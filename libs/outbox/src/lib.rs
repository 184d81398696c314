//! Durable at-least-once delivery.
//!
//! The outbox pattern: persist the intent to send before attempting network
//! delivery, then pump persisted records out asynchronously. A crash between
//! persist and delivery is recovered by the polling loop on restart; nothing
//! enqueued is ever silently dropped.

pub mod dead_letter;
pub mod dispatcher;
pub mod record;

pub use dead_letter::{
    DeadLetterEntity, DeadLetterService, DeadLetterStore, InMemoryDeadLetterStore, NewDeadLetter,
};
pub use dispatcher::{OutboxDispatcher, OutboxDispatcherConfig};
pub use record::{InMemoryOutboxStore, OutboxRecord, OutboxStore};

use transport::TransportError;
use uuid::Uuid;

/// Outbox and dead-letter error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("store operation failed: {0}")]
    Store(String),

    #[error("message {0} is already enqueued")]
    DuplicateMessage(Uuid),

    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error("dead-letter entry {0} not found")]
    DeadLetterNotFound(u64),

    #[error("no destination to replay to")]
    NoReplayDestination,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl OutboxError {
    pub fn store(msg: impl Into<String>) -> Self {
        OutboxError::Store(msg.into())
    }
}
