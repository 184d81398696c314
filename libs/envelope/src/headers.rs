//! Case-insensitive header map with a closed set of value types.
//!
//! Headers stay a string-keyed map, but values are restricted to a small
//! variant set (text, flag, timestamp) so they survive any wire format
//! without an open "object" type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known header names used by the bus core.
pub mod names {
    /// Request id echoed by responses, in addition to the correlation id.
    pub const REQUEST_ID: &str = "omnibus-request-id";
    /// Explicit address a response should be sent to.
    pub const RESPONSE_ADDRESS: &str = "omnibus-response-address";
    /// Address of the endpoint that produced the message.
    pub const SOURCE_ADDRESS: &str = "omnibus-source-address";
    /// Short machine-readable reason a message was dead-lettered.
    pub const FAULT_REASON: &str = "omnibus-fault-reason";
    /// Human-readable description of the failure.
    pub const FAULT_MESSAGE: &str = "omnibus-fault-message";
    /// Number of delivery attempts before dead-lettering.
    pub const REDELIVERY_COUNT: &str = "omnibus-redelivery-count";
}

/// A header value. Closed variant set by design of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderValue {
    Text(String),
    Flag(bool),
    Timestamp(DateTime<Utc>),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            HeaderValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            HeaderValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Flag(b)
    }
}

impl From<DateTime<Utc>> for HeaderValue {
    fn from(t: DateTime<Utc>) -> Self {
        HeaderValue::Timestamp(t)
    }
}

/// String-keyed header map with case-insensitive keys.
///
/// Keys are folded to lowercase on insert and lookup, so `Request-Id` and
/// `request-id` address the same entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: BTreeMap<String, HeaderValue>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any existing value under the same key.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<HeaderValue>) {
        self.entries
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Builder-style insert for constructing maps inline.
    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<HeaderValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<&HeaderValue> {
        self.entries.get(&key.as_ref().to_ascii_lowercase())
    }

    /// Convenience accessor for text-valued headers.
    pub fn get_text(&self, key: impl AsRef<str>) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_text)
    }

    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.entries.contains_key(&key.as_ref().to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: impl AsRef<str>) -> Option<HeaderValue> {
        self.entries.remove(&key.as_ref().to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
