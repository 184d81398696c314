//! Request/response layered on the bus core.
//!
//! The client lazily creates one private response endpoint (guarded so
//! concurrent first use still creates exactly one), correlates replies by
//! request id, and races each wait against a timeout. Responses for unknown
//! or already-timed-out request ids are dropped silently.

use crate::bus::BusInner;
use crate::BusError;
use dashmap::DashMap;
use envelope::{names, BusMessage, Envelope};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;
use transport::{handler_fn, ReceiveEndpoint, ReceiveEndpointConfig};
use url::Url;
use uuid::Uuid;

/// Sends `TRequest` messages to a fixed destination and awaits correlated
/// responses. Cheap to clone; clones share the response endpoint.
pub struct RequestClient<TRequest> {
    shared: Arc<ClientShared>,
    _marker: PhantomData<fn(TRequest)>,
}

impl<TRequest> Clone for RequestClient<TRequest> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

struct ClientShared {
    bus: Arc<BusInner>,
    destination: Url,
    response_address: Url,
    timeout: Duration,
    pending: Arc<DashMap<Uuid, oneshot::Sender<Envelope>>>,
    /// Guards lazy creation of the response endpoint.
    endpoint: Mutex<Option<Arc<dyn ReceiveEndpoint>>>,
}

impl<TRequest: BusMessage> RequestClient<TRequest> {
    pub(crate) fn new(bus: Arc<BusInner>, destination: Url, timeout: Duration) -> Self {
        // Each client gets its own private reply address under the bus path.
        let mut response_address = bus.address.clone();
        let base = response_address.path().trim_end_matches('/').to_string();
        response_address.set_path(&format!("{base}/responses/{}", Uuid::new_v4()));

        Self {
            shared: Arc::new(ClientShared {
                bus,
                destination,
                response_address,
                timeout,
                pending: Arc::new(DashMap::new()),
                endpoint: Mutex::new(None),
            }),
            _marker: PhantomData,
        }
    }

    /// Send `request` and await the single correlated response.
    ///
    /// Fails with [`BusError::RequestTimeout`] when no response arrives
    /// within the client's timeout; the pending entry is removed either way.
    pub async fn get_response<TResponse: BusMessage>(
        &self,
        request: &TRequest,
    ) -> Result<TResponse, BusError> {
        self.ensure_response_endpoint().await?;

        let shared = &self.shared;
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        shared.pending.insert(request_id, tx);

        let body = shared.bus.serializer.encode(request)?;
        let envelope = Envelope::builder(TRequest::message_type())
            .body(body)
            .content_type(shared.bus.serializer.content_type())
            .correlation_id(request_id)
            .header(names::REQUEST_ID, request_id.to_string())
            .header(names::RESPONSE_ADDRESS, shared.response_address.as_str())
            .header(names::SOURCE_ADDRESS, shared.bus.address.as_str())
            .build();

        let send = async {
            let host = shared.bus.hosts.resolve(&shared.destination)?;
            let transport = host.send_transport(&shared.destination).await?;
            transport.send(envelope).await?;
            Ok::<(), BusError>(())
        };
        if let Err(err) = send.await {
            shared.pending.remove(&request_id);
            return Err(err);
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.timeout) => {
                shared.pending.remove(&request_id);
                Err(BusError::RequestTimeout { timeout: shared.timeout })
            }
            reply = rx => {
                let envelope = reply.map_err(|_| {
                    BusError::configuration("response channel closed before a reply arrived")
                })?;
                Ok(shared.bus.serializer.decode(envelope.body())?)
            }
        }
    }

    /// Create and start the response endpoint exactly once, even under
    /// concurrent first use.
    async fn ensure_response_endpoint(&self) -> Result<(), BusError> {
        let mut guard = self.shared.endpoint.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let pending = self.shared.pending.clone();
        let config = ReceiveEndpointConfig::new(
            self.shared.response_address.clone(),
            handler_fn(move |ctx| {
                let pending = pending.clone();
                async move {
                    let request_id = ctx.envelope.correlation_id().or_else(|| {
                        ctx.envelope
                            .headers()
                            .get_text(names::REQUEST_ID)
                            .and_then(|s| Uuid::parse_str(s).ok())
                    });
                    match request_id.and_then(|id| pending.remove(&id)) {
                        Some((_, tx)) => {
                            // Receiver gone means the request already timed out.
                            let _ = tx.send(ctx.envelope);
                        }
                        None => {
                            debug!(
                                message_id = %ctx.envelope.message_id(),
                                "dropping response with no matching pending request"
                            );
                        }
                    }
                    Ok(())
                }
            }),
        );

        let host = self.shared.bus.hosts.resolve(&self.shared.response_address)?;
        let endpoint = host.connect_receive_endpoint(config)?;
        endpoint.start().await?;
        *guard = Some(endpoint);
        Ok(())
    }

    /// The per-request timeout this client was created with.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }
}
