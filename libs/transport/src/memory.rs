//! In-process transport host.
//!
//! The loopback transport every test uses, and the default host for a bus
//! that never leaves the process. Delivery is an in-place handler invocation,
//! so send/publish errors propagate straight back to the producer (which is
//! what lets the outbox dispatcher retry them).

use crate::{
    Envelope, PublishTransport, ReceiveContext, ReceiveEndpoint, ReceiveEndpointConfig,
    ReceivePipeline, SendTransport, TransportError, TransportHost,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

struct HostInner {
    address: Url,
    endpoints: DashMap<String, Arc<MemoryEndpoint>>,
    /// message type -> subscribed endpoint addresses
    subscriptions: DashMap<String, Vec<String>>,
    started: AtomicBool,
}

impl HostInner {
    fn endpoint(&self, address: &Url) -> Option<Arc<MemoryEndpoint>> {
        self.endpoints.get(address.as_str()).map(|e| e.clone())
    }

    async fn deliver(&self, address: &Url, envelope: Envelope) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::connection_failed(format!(
                "host {} is not started",
                self.address
            )));
        }
        let endpoint = self
            .endpoint(address)
            .ok_or_else(|| TransportError::unknown_destination(address))?;
        endpoint.deliver(envelope).await
    }
}

/// In-process transport host (`loopback` scheme by convention).
#[derive(Clone)]
pub struct MemoryHost {
    inner: Arc<HostInner>,
}

impl MemoryHost {
    pub fn new(address: Url) -> Self {
        Self {
            inner: Arc::new(HostInner {
                address,
                endpoints: DashMap::new(),
                subscriptions: DashMap::new(),
                started: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl TransportHost for MemoryHost {
    fn address(&self) -> &Url {
        &self.inner.address
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.inner.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connect_receive_endpoint(
        &self,
        config: ReceiveEndpointConfig,
    ) -> Result<Arc<dyn ReceiveEndpoint>, TransportError> {
        let key = config.input_address.as_str().to_string();
        if self.inner.endpoints.contains_key(&key) {
            return Err(TransportError::EndpointAlreadyRegistered { address: key });
        }

        let endpoint = Arc::new(MemoryEndpoint {
            input_address: config.input_address.clone(),
            pipeline: ReceivePipeline::from_config(&config),
            started: AtomicBool::new(false),
            cancellation: Mutex::new(CancellationToken::new()),
            host: Arc::downgrade(&self.inner),
        });
        self.inner.endpoints.insert(key.clone(), endpoint.clone());
        for message_type in &config.subscriptions {
            self.inner
                .subscriptions
                .entry(message_type.clone())
                .or_default()
                .push(key.clone());
        }
        debug!(input_address = %config.input_address, "connected receive endpoint");
        Ok(endpoint)
    }

    async fn send_transport(
        &self,
        address: &Url,
    ) -> Result<Arc<dyn SendTransport>, TransportError> {
        Ok(Arc::new(MemorySendTransport {
            host: Arc::downgrade(&self.inner),
            destination: address.clone(),
        }))
    }

    async fn publish_transport(
        &self,
        message_type: &str,
    ) -> Result<Arc<dyn PublishTransport>, TransportError> {
        Ok(Arc::new(MemoryPublishTransport {
            host: Arc::downgrade(&self.inner),
            message_type: message_type.to_string(),
        }))
    }
}

struct MemoryEndpoint {
    input_address: Url,
    pipeline: ReceivePipeline,
    started: AtomicBool,
    /// Replaced with a fresh token on restart; `stop` cancels the current one.
    cancellation: Mutex<CancellationToken>,
    host: Weak<HostInner>,
}

impl MemoryEndpoint {
    async fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted {
                address: self.input_address.to_string(),
            });
        }
        let ctx = ReceiveContext::new(envelope)
            .with_destination(self.input_address.clone())
            .with_cancellation(self.cancellation.lock().child_token());

        // Bind the dead-letter transport only when one is configured.
        let dead_letter: Option<Arc<dyn SendTransport>> =
            self.pipeline.dead_letter_address().map(|address| {
                Arc::new(MemorySendTransport {
                    host: self.host.clone(),
                    destination: address.clone(),
                }) as Arc<dyn SendTransport>
            });

        self.pipeline.dispatch(ctx, dead_letter.as_deref()).await
    }
}

#[async_trait]
impl ReceiveEndpoint for MemoryEndpoint {
    fn input_address(&self) -> &Url {
        &self.input_address
    }

    async fn start(&self) -> Result<(), TransportError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            let mut cancellation = self.cancellation.lock();
            if cancellation.is_cancelled() {
                *cancellation = CancellationToken::new();
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if self.started.swap(false, Ordering::SeqCst) {
            self.cancellation.lock().cancel();
        }
        Ok(())
    }
}

struct MemorySendTransport {
    host: Weak<HostInner>,
    destination: Url,
}

#[async_trait]
impl SendTransport for MemorySendTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| TransportError::connection_failed("host dropped"))?;
        host.deliver(&self.destination, envelope).await
    }
}

struct MemoryPublishTransport {
    host: Weak<HostInner>,
    message_type: String,
}

#[async_trait]
impl PublishTransport for MemoryPublishTransport {
    async fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| TransportError::connection_failed("host dropped"))?;

        let subscribers: Vec<String> = host
            .subscriptions
            .get(&self.message_type)
            .map(|s| s.clone())
            .unwrap_or_default();

        let mut first_err = None;
        for address in subscribers {
            let url = Url::parse(&address)
                .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
            if let Err(err) = host.deliver(&url, envelope.clone()).await {
                debug!(subscriber = %address, error = %err, "publish delivery failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
