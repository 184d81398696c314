//! The message envelope itself.

use crate::headers::{HeaderMap, HeaderValue};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Transport-neutral wrapper around a serialized message payload.
///
/// An envelope is created once per send/publish call and never mutated
/// afterwards; the `with_*` methods return modified copies. The body is never
/// absent (an empty byte sequence is allowed) and the header map always
/// exists.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: Bytes,
    content_type: String,
    headers: HeaderMap,
    message_id: Uuid,
    correlation_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
    message_type: String,
    sent_at: DateTime<Utc>,
}

impl Envelope {
    /// Start building an envelope for a message type.
    pub fn builder(message_type: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// Copy of this envelope with one additional header.
    pub fn with_header(&self, key: impl AsRef<str>, value: impl Into<HeaderValue>) -> Self {
        let mut copy = self.clone();
        copy.headers.set(key, value);
        copy
    }

    /// Copy of this envelope with the correlation id replaced.
    pub fn with_correlation_id(&self, correlation_id: Uuid) -> Self {
        let mut copy = self.clone();
        copy.correlation_id = Some(correlation_id);
        copy
    }
}

/// Builder for [`Envelope`]. Defaults: empty body, `application/json`
/// content type, generated message id, `sent_at` = now.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    body: Bytes,
    content_type: String,
    headers: HeaderMap,
    message_id: Uuid,
    correlation_id: Option<Uuid>,
    conversation_id: Option<Uuid>,
    message_type: String,
}

impl EnvelopeBuilder {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            body: Bytes::new(),
            content_type: "application/json".to_string(),
            headers: HeaderMap::new(),
            message_id: Uuid::new_v4(),
            correlation_id: None,
            conversation_id: None,
            message_type: message_type.into(),
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn header(mut self, key: impl AsRef<str>, value: impl Into<HeaderValue>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn conversation_id(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            body: self.body,
            content_type: self.content_type,
            headers: self.headers,
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            conversation_id: self.conversation_id,
            message_type: self.message_type,
            sent_at: Utc::now(),
        }
    }
}
