//! Bus core: the single entry point for send, publish, and respond.

use crate::scheduler::PersistedScheduler;
use crate::BusError;
use envelope::{names, BusMessage, Envelope, JsonSerializer, MessageSerializer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use transport::{
    HostRegistry, ReceiveContext, ReceiveEndpoint, ReceiveEndpointConfig, SendTransport,
    TransportHost,
};
use url::Url;
use uuid::Uuid;

/// Derives the conventional destination address for a request message type.
pub(crate) type RequestAddressResolver = Arc<dyn Fn(&str) -> Option<Url> + Send + Sync>;

pub(crate) struct BusInner {
    pub(crate) address: Url,
    pub(crate) hosts: Arc<HostRegistry>,
    pub(crate) serializer: Arc<dyn MessageSerializer>,
    pub(crate) endpoints: Mutex<Vec<Arc<dyn ReceiveEndpoint>>>,
    pub(crate) request_address_resolver: Option<RequestAddressResolver>,
    scheduler: Mutex<Option<Arc<PersistedScheduler>>>,
    started: AtomicBool,
}

impl BusInner {
    /// Build an outgoing envelope for `message`, stamped with the bus's
    /// source address.
    pub(crate) fn envelope_for<T: BusMessage>(&self, message: &T) -> Result<Envelope, BusError> {
        let body = self.serializer.encode(message)?;
        Ok(Envelope::builder(T::message_type())
            .body(body)
            .content_type(self.serializer.content_type())
            .header(names::SOURCE_ADDRESS, self.address.as_str())
            .build())
    }
}

/// The application message bus.
///
/// Cheap to clone; all clones share the same hosts, endpoints, and lifecycle.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn builder(address: Url) -> BusBuilder {
        BusBuilder::new(address)
    }

    /// The bus's own logical address.
    pub fn address(&self) -> &Url {
        &self.inner.address
    }

    pub fn hosts(&self) -> Arc<HostRegistry> {
        self.inner.hosts.clone()
    }

    pub fn serializer(&self) -> Arc<dyn MessageSerializer> {
        self.inner.serializer.clone()
    }

    /// Broadcast `message` to every endpoint subscribed to its type.
    pub async fn publish<T: BusMessage>(&self, message: &T) -> Result<(), BusError> {
        let envelope = self.inner.envelope_for(message)?;
        let host = self.inner.hosts.resolve(&self.inner.address)?;
        let transport = host.publish_transport(T::message_type()).await?;
        transport.publish(envelope).await?;
        Ok(())
    }

    /// Obtain a send endpoint bound to `address` for point-to-point delivery.
    pub async fn send_endpoint(&self, address: &Url) -> Result<SendEndpoint, BusError> {
        let host = self.inner.hosts.resolve(address)?;
        let transport = host.send_transport(address).await?;
        Ok(SendEndpoint {
            inner: self.inner.clone(),
            transport,
        })
    }

    /// Send a response for a consumed message.
    ///
    /// The destination is the message's explicit response address if present,
    /// else its source address. The response echoes the request's correlation
    /// id (or request-id header) so the waiting client can match it.
    pub async fn respond<T: BusMessage>(
        &self,
        ctx: &ReceiveContext,
        message: &T,
    ) -> Result<(), BusError> {
        let destination = ctx.response_address().ok_or_else(|| {
            BusError::configuration(
                "cannot respond: message carries neither a response address nor a source address",
            )
        })?;

        let correlation = ctx
            .envelope
            .correlation_id()
            .or_else(|| request_id_header(&ctx.envelope));

        let body = self.inner.serializer.encode(message)?;
        let mut builder = Envelope::builder(T::message_type())
            .body(body)
            .content_type(self.inner.serializer.content_type())
            .header(names::SOURCE_ADDRESS, self.inner.address.as_str());
        if let Some(id) = correlation {
            builder = builder
                .correlation_id(id)
                .header(names::REQUEST_ID, id.to_string());
        }

        let host = self.inner.hosts.resolve(&destination)?;
        let transport = host.send_transport(&destination).await?;
        transport.send(builder.build()).await?;
        Ok(())
    }

    /// Create a request client for `T`, using the configured request-address
    /// resolver to derive the destination.
    pub fn request_client<T: BusMessage>(
        &self,
        timeout: Duration,
    ) -> Result<crate::RequestClient<T>, BusError> {
        let resolver = self.inner.request_address_resolver.as_ref().ok_or_else(|| {
            BusError::configuration("no request address resolver configured on this bus")
        })?;
        let destination = resolver(T::message_type()).ok_or_else(|| {
            BusError::configuration(format!(
                "no request address derivable for message type '{}'",
                T::message_type()
            ))
        })?;
        Ok(crate::RequestClient::new(
            self.inner.clone(),
            destination,
            timeout,
        ))
    }

    /// Bind a receive endpoint through the host owning its input address.
    /// If the bus is already started, the endpoint is started immediately.
    pub async fn connect_receive_endpoint(
        &self,
        config: ReceiveEndpointConfig,
    ) -> Result<Arc<dyn ReceiveEndpoint>, BusError> {
        let host = self.inner.hosts.resolve(&config.input_address)?;
        let endpoint = host.connect_receive_endpoint(config)?;
        if self.inner.started.load(Ordering::SeqCst) {
            endpoint.start().await?;
        }
        self.inner.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }

    /// Attach a persisted scheduler so [`Bus::shutdown`] tears it down too.
    pub fn attach_scheduler(&self, scheduler: Arc<PersistedScheduler>) {
        *self.inner.scheduler.lock() = Some(scheduler);
    }

    /// Start hosts first, then endpoints (endpoints depend on host
    /// readiness). Idempotent.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for host in self.inner.hosts.hosts() {
            host.start().await?;
        }
        let endpoints: Vec<_> = self.inner.endpoints.lock().clone();
        for endpoint in endpoints {
            endpoint.start().await?;
        }
        info!(address = %self.inner.address, "bus started");
        Ok(())
    }

    /// Stop endpoints first, then hosts, so no host is torn down while an
    /// endpoint still references it. Idempotent.
    pub async fn stop(&self) -> Result<(), BusError> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let endpoints: Vec<_> = self.inner.endpoints.lock().clone();
        for endpoint in endpoints {
            endpoint.stop().await?;
        }
        for host in self.inner.hosts.hosts() {
            host.stop().await?;
        }
        info!(address = %self.inner.address, "bus stopped");
        Ok(())
    }

    /// Full teardown: stop the bus and any attached scheduler. Safe to call
    /// multiple times.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.stop().await?;
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }
        debug!("bus shut down");
        Ok(())
    }
}

fn request_id_header(envelope: &Envelope) -> Option<Uuid> {
    envelope
        .headers()
        .get_text(names::REQUEST_ID)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// A send transport bound to one destination, with typed serialization.
pub struct SendEndpoint {
    inner: Arc<BusInner>,
    transport: Arc<dyn SendTransport>,
}

impl SendEndpoint {
    pub async fn send<T: BusMessage>(&self, message: &T) -> Result<(), BusError> {
        let envelope = self.inner.envelope_for(message)?;
        self.transport.send(envelope).await?;
        Ok(())
    }
}

/// Assembles a [`Bus`] from hosts, serializer, and addressing policy.
pub struct BusBuilder {
    address: Url,
    hosts: Arc<HostRegistry>,
    serializer: Arc<dyn MessageSerializer>,
    request_address_resolver: Option<RequestAddressResolver>,
}

impl BusBuilder {
    pub fn new(address: Url) -> Self {
        Self {
            address,
            hosts: Arc::new(HostRegistry::new()),
            serializer: Arc::new(JsonSerializer::new()),
            request_address_resolver: None,
        }
    }

    pub fn host(self, host: Arc<dyn TransportHost>) -> Self {
        self.hosts.register(host);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Map a message-type name to the address requests for it are sent to.
    pub fn request_address_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<Url> + Send + Sync + 'static,
    {
        self.request_address_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn build(self) -> Bus {
        Bus {
            inner: Arc::new(BusInner {
                address: self.address,
                hosts: self.hosts,
                serializer: self.serializer,
                endpoints: Mutex::new(Vec::new()),
                request_address_resolver: self.request_address_resolver,
                scheduler: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }
}
