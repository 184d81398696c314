//! Persisted representation of an outgoing message, plus the store contract.

use crate::OutboxError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use envelope::{Envelope, HeaderMap};
use parking_lot::Mutex;
use url::Url;
use uuid::Uuid;

/// A persisted outgoing message.
///
/// Exactly one of two shapes: a destination address (point-to-point send) or
/// no destination (publish, routed by message type). Records are immutable
/// after creation except for `sent_at`, set once on successful delivery;
/// they are never deleted by the dispatcher (audit trail).
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub message_id: Uuid,
    pub body: Bytes,
    pub content_type: String,
    pub headers: HeaderMap,
    pub correlation_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub source_address: Option<Url>,
    /// `Some` = send, `None` = publish by message type.
    pub destination_address: Option<Url>,
    pub message_type: String,
    pub enqueued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Record a point-to-point send.
    pub fn send(envelope: &Envelope, destination: Url, source: Option<Url>) -> Self {
        Self::from_envelope(envelope, Some(destination), source)
    }

    /// Record a publish, routed by the envelope's message type.
    pub fn publish(envelope: &Envelope, source: Option<Url>) -> Self {
        Self::from_envelope(envelope, None, source)
    }

    fn from_envelope(envelope: &Envelope, destination: Option<Url>, source: Option<Url>) -> Self {
        Self {
            message_id: envelope.message_id(),
            body: envelope.body().clone(),
            content_type: envelope.content_type().to_string(),
            headers: envelope.headers().clone(),
            correlation_id: envelope.correlation_id(),
            conversation_id: envelope.conversation_id(),
            source_address: source,
            destination_address: destination,
            message_type: envelope.message_type().to_string(),
            enqueued_at: Utc::now(),
            sent_at: None,
        }
    }

    /// Key under which delivery concurrency is serialized.
    pub fn destination_key(&self) -> String {
        match &self.destination_address {
            Some(address) => address.to_string(),
            None => format!("publish:{}", self.message_type),
        }
    }

    /// Rebuild the wire envelope from the persisted fields.
    pub fn to_envelope(&self) -> Envelope {
        let mut builder = Envelope::builder(self.message_type.clone())
            .message_id(self.message_id)
            .body(self.body.clone())
            .content_type(self.content_type.clone())
            .headers(self.headers.clone());
        if let Some(id) = self.correlation_id {
            builder = builder.correlation_id(id);
        }
        if let Some(id) = self.conversation_id {
            builder = builder.conversation_id(id);
        }
        builder.build()
    }
}

/// Storage contract for the outbox.
///
/// The store is the system of record; the dispatcher's in-memory structures
/// are claims over it, never the sole source of truth. Requirements: message
/// id uniqueness, stable enqueue ordering for `get_pending`, and per-message
/// atomic mark-sent.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a record. This is the durability point of `enqueue`.
    async fn add(&self, record: OutboxRecord) -> Result<(), OutboxError>;

    /// Not-yet-sent records in enqueue order, bounded by `max`.
    async fn get_pending(&self, max: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Record successful delivery.
    async fn mark_sent(&self, message_id: Uuid, sent_at: DateTime<Utc>) -> Result<(), OutboxError>;
}

/// Vec-backed store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, message_id: Uuid) -> Option<OutboxRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.message_id == message_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn add(&self, record: OutboxRecord) -> Result<(), OutboxError> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.message_id == record.message_id) {
            return Err(OutboxError::DuplicateMessage(record.message_id));
        }
        records.push(record);
        Ok(())
    }

    async fn get_pending(&self, max: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.sent_at.is_none())
            .take(max)
            .cloned()
            .collect())
    }

    async fn mark_sent(&self, message_id: Uuid, sent_at: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.message_id == message_id)
            .ok_or(OutboxError::NotFound(message_id))?;
        record.sent_at = Some(sent_at);
        Ok(())
    }
}
