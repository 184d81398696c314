//! Message-driven saga routing.
//!
//! A [`SagaRouter`] sits behind a receive endpoint and, for each inbound
//! message, finds the saga instance it belongs to (keyed by correlation id,
//! falling back to conversation id), invokes the registered handler, and
//! persists the mutated instance through the repository with optimistic
//! concurrency.

use crate::{SagaError, SagaInstance, SagaRepository, SagaStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use envelope::{BusMessage, MessageSerializer};
use std::sync::Arc;
use transport::ReceiveContext;
use tracing::{debug, info};
use uuid::Uuid;

/// What the handler wants done with the instance after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Persist the instance and await further messages.
    Continue,
    /// The saga is finished; mark it completed and remove it.
    Complete,
}

/// Handler for one message type within a saga.
#[async_trait]
pub trait SagaMessageHandler: Send + Sync {
    /// Whether this message type may start a new saga instance.
    fn can_start(&self) -> bool;

    async fn handle(
        &self,
        instance: &mut SagaInstance,
        ctx: &ReceiveContext,
    ) -> Result<SagaOutcome, SagaError>;
}

/// Decodes the message body into `M` before invoking a typed closure.
pub struct TypedSagaHandler<M, F> {
    serializer: Arc<dyn MessageSerializer>,
    can_start: bool,
    handler: F,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M, F, Fut> TypedSagaHandler<M, F>
where
    M: BusMessage,
    F: Fn(M, SagaInstance) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(SagaInstance, SagaOutcome), SagaError>> + Send,
{
    pub fn new(serializer: Arc<dyn MessageSerializer>, can_start: bool, handler: F) -> Self {
        Self {
            serializer,
            can_start,
            handler,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<M, F, Fut> SagaMessageHandler for TypedSagaHandler<M, F>
where
    M: BusMessage,
    F: Fn(M, SagaInstance) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(SagaInstance, SagaOutcome), SagaError>> + Send,
{
    fn can_start(&self) -> bool {
        self.can_start
    }

    async fn handle(
        &self,
        instance: &mut SagaInstance,
        ctx: &ReceiveContext,
    ) -> Result<SagaOutcome, SagaError> {
        let message: M = self.serializer.decode(ctx.envelope.body())?;
        let (updated, outcome) = (self.handler)(message, instance.clone()).await?;
        *instance = updated;
        Ok(outcome)
    }
}

/// Routes inbound messages to saga handlers and persists the result.
pub struct SagaRouter {
    repository: Arc<dyn SagaRepository>,
    handlers: DashMap<(String, String), Arc<dyn SagaMessageHandler>>,
}

impl SagaRouter {
    pub fn new(repository: Arc<dyn SagaRepository>) -> Self {
        Self {
            repository,
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for `message_type` arriving at `input_address`.
    /// A second registration for the same pair is rejected.
    pub fn register(
        &self,
        input_address: &url::Url,
        message_type: impl Into<String>,
        handler: Arc<dyn SagaMessageHandler>,
    ) -> Result<(), SagaError> {
        let message_type = message_type.into();
        let key = (input_address.to_string(), message_type.clone());
        match self.handlers.entry(key) {
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(handler);
                Ok(())
            }
            dashmap::Entry::Occupied(_) => Err(SagaError::DuplicateRegistration {
                address: input_address.to_string(),
                message_type,
            }),
        }
    }

    /// Handle one inbound message end to end.
    ///
    /// Messages that match no registered handler, or that reference no
    /// existing instance and whose handler cannot start one, are ignored.
    pub async fn dispatch(&self, ctx: &ReceiveContext) -> Result<(), SagaError> {
        let destination = ctx
            .destination_address
            .as_ref()
            .ok_or(SagaError::MissingDestination)?;

        let message_type = ctx.envelope.message_type().to_string();
        let key = (destination.to_string(), message_type.clone());
        let handler = match self.handlers.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(%destination, message_type, "no saga handler registered, ignoring");
                return Ok(());
            }
        };

        let correlation_id = self.correlation_key(ctx);
        let mut instance = match self.repository.get(correlation_id).await? {
            Some(existing) => existing,
            None if handler.can_start() => {
                info!(%correlation_id, message_type, "starting saga instance");
                SagaInstance::new(correlation_id, ctx.envelope.conversation_id())
            }
            None => {
                debug!(%correlation_id, message_type, "no saga instance and handler cannot start one, ignoring");
                return Ok(());
            }
        };

        match handler.handle(&mut instance, ctx).await? {
            SagaOutcome::Complete => {
                instance.status = Some(SagaStatus::Completed);
                self.repository.delete(instance.correlation_id).await?;
                info!(correlation_id = %instance.correlation_id, "saga completed");
                Ok(())
            }
            SagaOutcome::Continue => {
                if self.repository.save(&mut instance).await? {
                    Ok(())
                } else {
                    Err(SagaError::VersionConflict {
                        correlation_id: instance.correlation_id,
                    })
                }
            }
        }
    }

    /// Correlation id if set, else conversation id, else the message id
    /// itself (so a start message with no ids still keys deterministically).
    fn correlation_key(&self, ctx: &ReceiveContext) -> Uuid {
        ctx.envelope
            .correlation_id()
            .or_else(|| ctx.envelope.conversation_id())
            .unwrap_or_else(|| ctx.envelope.message_id())
    }
}
