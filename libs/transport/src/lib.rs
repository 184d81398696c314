//! Transport abstraction for the bus core.
//!
//! Everything the bus does — send, publish, request/response, the outbox
//! pump — goes through the contracts in this crate. A wire protocol plugs in
//! by implementing [`TransportHost`] and handing out [`SendTransport`] /
//! [`PublishTransport`] instances; the bus never sees the protocol itself.
//!
//! The crate also carries the pieces every host shares: address resolution
//! ([`resolver::HostRegistry`]), retry + circuit-breaker wrapping
//! ([`resilience`]), the receive-side handler pipeline with dead-letter
//! fallback ([`pipeline::ReceivePipeline`]), and the in-process transport
//! ([`memory::MemoryHost`]) used as the default host and by every test.

pub mod error;
pub mod memory;
pub mod pipeline;
pub mod resilience;
pub mod resolver;

pub use error::TransportError;
pub use memory::MemoryHost;
pub use pipeline::ReceivePipeline;
pub use resilience::{
    BreakerSettings, CircuitBreaker, CircuitState, ResilientPublish, ResilientSend, RetryPolicy,
};
pub use resolver::HostRegistry;

pub use envelope::Envelope;

use async_trait::async_trait;
use envelope::names;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One-way point-to-point delivery bound to a destination address.
///
/// Implementations must be safe to call repeatedly; transient failures are
/// reported as errors, never swallowed.
#[async_trait]
pub trait SendTransport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Broadcast delivery for one message type.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Everything a handler gets about an inbound message.
#[derive(Debug, Clone)]
pub struct ReceiveContext {
    pub envelope: Envelope,
    pub source_address: Option<Url>,
    pub destination_address: Option<Url>,
    pub cancellation: CancellationToken,
}

impl ReceiveContext {
    pub fn new(envelope: Envelope) -> Self {
        let source_address = envelope
            .headers()
            .get_text(names::SOURCE_ADDRESS)
            .and_then(|s| Url::parse(s).ok());
        Self {
            envelope,
            source_address,
            destination_address: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_destination(mut self, destination: Url) -> Self {
        self.destination_address = Some(destination);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Address a response should go to: the explicit response-address header
    /// if present, else the message's source address.
    pub fn response_address(&self) -> Option<Url> {
        self.envelope
            .headers()
            .get_text(names::RESPONSE_ADDRESS)
            .and_then(|s| Url::parse(s).ok())
            .or_else(|| self.source_address.clone())
    }
}

/// Consumer callback invoked for each inbound message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: ReceiveContext) -> Result<(), TransportError>;
}

/// Adapt an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ReceiveContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), TransportError>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> MessageHandler for FnHandler<F>
    where
        F: Fn(ReceiveContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        async fn handle(&self, ctx: ReceiveContext) -> Result<(), TransportError> {
            (self.0)(ctx).await
        }
    }

    Arc::new(FnHandler(f))
}

/// Configuration for binding a receive endpoint to an input address.
#[derive(Clone)]
pub struct ReceiveEndpointConfig {
    pub input_address: Url,
    pub handler: Arc<dyn MessageHandler>,
    /// Message types this endpoint receives from publish fan-out.
    pub subscriptions: Vec<String>,
    /// Retry applied to handler invocation before dead-lettering.
    pub retry: RetryPolicy,
    /// Where to forward messages the handler could not process.
    pub dead_letter_address: Option<Url>,
}

impl ReceiveEndpointConfig {
    pub fn new(input_address: Url, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            input_address,
            handler,
            subscriptions: Vec::new(),
            retry: RetryPolicy::none(),
            dead_letter_address: None,
        }
    }

    pub fn subscribe(mut self, message_type: impl Into<String>) -> Self {
        self.subscriptions.push(message_type.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dead_letter_address(mut self, address: Url) -> Self {
        self.dead_letter_address = Some(address);
        self
    }
}

impl Debug for ReceiveEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveEndpointConfig")
            .field("input_address", &self.input_address.as_str())
            .field("subscriptions", &self.subscriptions)
            .field("dead_letter_address", &self.dead_letter_address)
            .finish()
    }
}

/// A logical inbound address bound to a handler.
#[async_trait]
pub trait ReceiveEndpoint: Send + Sync {
    fn input_address(&self) -> &Url;

    /// Idempotent.
    async fn start(&self) -> Result<(), TransportError>;

    /// Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;
}

/// A concrete transport owning a set of addresses under one authority.
#[async_trait]
pub trait TransportHost: Send + Sync {
    /// The host's own base address.
    fn address(&self) -> &Url;

    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;

    /// Bind a receive endpoint to an input address. Registering a second
    /// endpoint at the same input address is a configuration error.
    fn connect_receive_endpoint(
        &self,
        config: ReceiveEndpointConfig,
    ) -> Result<Arc<dyn ReceiveEndpoint>, TransportError>;

    async fn send_transport(&self, address: &Url)
        -> Result<Arc<dyn SendTransport>, TransportError>;

    async fn publish_transport(
        &self,
        message_type: &str,
    ) -> Result<Arc<dyn PublishTransport>, TransportError>;
}
