//! Dead-letter queue: store contract and replay service.
//!
//! Holds messages that exhausted their delivery strategy or could not be
//! routed. Entries reference the original message by copy, not by key — the
//! producing system may no longer exist when an operator replays them.

use crate::OutboxError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use envelope::{Envelope, HeaderMap};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use transport::HostRegistry;
use url::Url;
use uuid::Uuid;

/// A message parked in the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterEntity {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// Short machine-readable cause, e.g. `consumer-fault`, `unroutable`.
    pub reason: String,
    pub description: String,
    pub destination_address: Option<Url>,
    pub source_address: Option<Url>,
    pub content_type: String,
    pub message_type: String,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub replay_count: u32,
    pub last_replay_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Fields supplied when parking a message; the store assigns the id and
/// replay bookkeeping.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub reason: String,
    pub description: String,
    pub destination_address: Option<Url>,
    pub source_address: Option<Url>,
    pub content_type: String,
    pub message_type: String,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl NewDeadLetter {
    /// Snapshot an envelope with a failure reason.
    pub fn from_envelope(
        envelope: &Envelope,
        reason: impl Into<String>,
        description: impl Into<String>,
        destination: Option<Url>,
    ) -> Self {
        Self {
            reason: reason.into(),
            description: description.into(),
            destination_address: destination,
            source_address: envelope
                .headers()
                .get_text(envelope::names::SOURCE_ADDRESS)
                .and_then(|s| Url::parse(s).ok()),
            content_type: envelope.content_type().to_string(),
            message_type: envelope.message_type().to_string(),
            correlation_id: envelope.correlation_id(),
            conversation_id: envelope.conversation_id(),
            headers: envelope.headers().clone(),
            body: envelope.body().clone(),
        }
    }
}

/// Storage contract for dead-lettered messages. Entries are never
/// auto-deleted.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Park a message; returns the assigned id.
    async fn add(&self, message: NewDeadLetter) -> Result<u64, OutboxError>;

    /// Page through entries, newest first. `page` is zero-based.
    async fn list(&self, page: usize, page_size: usize)
        -> Result<Vec<DeadLetterEntity>, OutboxError>;

    async fn get(&self, id: u64) -> Result<Option<DeadLetterEntity>, OutboxError>;

    /// Record a replay attempt; `error` is `None` on success.
    async fn record_replay(&self, id: u64, error: Option<String>) -> Result<(), OutboxError>;
}

/// Re-sends a parked message to its original (or an overridden) destination.
pub struct DeadLetterService {
    store: Arc<dyn DeadLetterStore>,
    hosts: Arc<HostRegistry>,
}

impl DeadLetterService {
    pub fn new(store: Arc<dyn DeadLetterStore>, hosts: Arc<HostRegistry>) -> Self {
        Self { store, hosts }
    }

    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Replay entry `id`, recording the outcome either way.
    pub async fn replay(&self, id: u64, override_destination: Option<Url>) -> Result<(), OutboxError> {
        let entity = self
            .store
            .get(id)
            .await?
            .ok_or(OutboxError::DeadLetterNotFound(id))?;

        let destination = override_destination
            .or_else(|| entity.destination_address.clone())
            .ok_or(OutboxError::NoReplayDestination)?;

        let outcome = self.resend(&entity, &destination).await;
        self.store
            .record_replay(id, outcome.as_ref().err().map(|e| e.to_string()))
            .await?;

        match &outcome {
            Ok(()) => info!(id, destination = %destination, "dead-letter replay succeeded"),
            Err(err) => warn!(id, destination = %destination, error = %err, "dead-letter replay failed"),
        }
        outcome
    }

    async fn resend(&self, entity: &DeadLetterEntity, destination: &Url) -> Result<(), OutboxError> {
        let mut builder = Envelope::builder(entity.message_type.clone())
            .body(entity.body.clone())
            .content_type(entity.content_type.clone())
            .headers(entity.headers.clone());
        if let Some(correlation_id) = entity.correlation_id {
            builder = builder.correlation_id(correlation_id);
        }
        if let Some(conversation_id) = entity.conversation_id {
            builder = builder.conversation_id(conversation_id);
        }

        let host = self.hosts.resolve(destination)?;
        let transport = host.send_transport(destination).await?;
        transport.send(builder.build()).await?;
        Ok(())
    }
}

/// Vec-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntity>>,
    next_id: AtomicU64,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn add(&self, message: NewDeadLetter) -> Result<u64, OutboxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push(DeadLetterEntity {
            id,
            created_at: Utc::now(),
            reason: message.reason,
            description: message.description,
            destination_address: message.destination_address,
            source_address: message.source_address,
            content_type: message.content_type,
            message_type: message.message_type,
            correlation_id: message.correlation_id,
            conversation_id: message.conversation_id,
            headers: message.headers,
            body: message.body,
            replay_count: 0,
            last_replay_at: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn list(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<DeadLetterEntity>, OutboxError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .rev()
            .skip(page * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn get(&self, id: u64) -> Result<Option<DeadLetterEntity>, OutboxError> {
        Ok(self.entries.lock().iter().find(|e| e.id == id).cloned())
    }

    async fn record_replay(&self, id: u64, error: Option<String>) -> Result<(), OutboxError> {
        let mut entries = self.entries.lock();
        let entity = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(OutboxError::DeadLetterNotFound(id))?;
        entity.replay_count += 1;
        entity.last_replay_at = Some(Utc::now());
        entity.last_error = error;
        Ok(())
    }
}
