//! Pluggable message body codec.
//!
//! The serializer is format-agnostic from the caller's point of view: typed
//! values are routed through `serde_json::Value` so the trait stays
//! object-safe and implementations can be swapped without touching consuming
//! code. The default codec is JSON.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("malformed message body: {0}")]
    Deserialize(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Serializes message bodies to and from bytes.
pub trait MessageSerializer: Send + Sync {
    /// MIME content type produced by this serializer.
    fn content_type(&self) -> &str;

    /// Serialize a value to bytes.
    fn serialize(&self, value: &Value) -> Result<Bytes, CodecError>;

    /// Deserialize bytes, failing on malformed input.
    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

impl dyn MessageSerializer {
    /// Serialize a typed value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        let value = serde_json::to_value(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
        self.serialize(&value)
    }

    /// Deserialize bytes into a typed value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let value = self.deserialize(bytes)?;
        serde_json::from_value(value).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// Default JSON codec (`application/json`).
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl MessageSerializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn serialize(&self, value: &Value) -> Result<Bytes, CodecError> {
        let bytes = serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
        Ok(Bytes::from(bytes))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}
