//! Transport-neutral message envelope.
//!
//! Every message that crosses a transport is wrapped in an [`Envelope`]: the
//! serialized body plus the metadata the bus needs to route, correlate, and
//! respond (ids, headers, content type, timestamps). Envelopes are immutable;
//! a "modified" envelope is always a new instance.

pub mod envelope;
pub mod headers;
pub mod serializer;

pub use envelope::{Envelope, EnvelopeBuilder};
pub use headers::{names, HeaderMap, HeaderValue};
pub use serializer::{CodecError, JsonSerializer, MessageSerializer};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed message that can travel over the bus.
///
/// The message-type name is resolved statically at registration time and is
/// what publish fan-out, request-address derivation, and envelope stamping
/// key on. Names should be stable across services (e.g. `"order.submitted"`).
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable, transport-visible name for this message type.
    fn message_type() -> &'static str;
}
