//! Receive-side handler pipeline: bounded retry, then dead-letter fallback.

use crate::{
    MessageHandler, ReceiveContext, ReceiveEndpointConfig, RetryPolicy, SendTransport,
    TransportError,
};
use envelope::names;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Wraps handler invocation for a receive endpoint.
///
/// A failing handler is retried per the endpoint's policy; if it still fails
/// and a dead-letter address is configured, the original envelope (plus fault
/// metadata headers) is forwarded there instead of being dropped. If the
/// forward itself fails, the error is surfaced so the transport redelivers.
pub struct ReceivePipeline {
    handler: Arc<dyn MessageHandler>,
    retry: RetryPolicy,
    dead_letter_address: Option<Url>,
}

impl ReceivePipeline {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        retry: RetryPolicy,
        dead_letter_address: Option<Url>,
    ) -> Self {
        Self {
            handler,
            retry,
            dead_letter_address,
        }
    }

    pub fn from_config(config: &ReceiveEndpointConfig) -> Self {
        Self::new(
            config.handler.clone(),
            config.retry.clone(),
            config.dead_letter_address.clone(),
        )
    }

    pub fn dead_letter_address(&self) -> Option<&Url> {
        self.dead_letter_address.as_ref()
    }

    /// Invoke the handler for one inbound message.
    ///
    /// `dead_letter` is the transport bound to the configured dead-letter
    /// address, supplied by the host when one is configured. A cancelled
    /// context is not a consumer fault: dispatch returns
    /// [`TransportError::Cancelled`] and the message is left for redelivery,
    /// never dead-lettered.
    pub async fn dispatch(
        &self,
        ctx: ReceiveContext,
        dead_letter: Option<&dyn SendTransport>,
    ) -> Result<(), TransportError> {
        let mut last_err: Option<TransportError> = None;
        let mut attempts = 0u32;

        for attempt in 1..=self.retry.max_attempts {
            if ctx.cancellation.is_cancelled() {
                debug!(
                    message_id = %ctx.envelope.message_id(),
                    "delivery cancelled, leaving message for redelivery"
                );
                return Err(TransportError::Cancelled);
            }
            attempts = attempt;
            match self.handler.handle(ctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(
                        attempt,
                        message_id = %ctx.envelope.message_id(),
                        error = %err,
                        "handler invocation failed"
                    );
                    last_err = Some(err);
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| TransportError::handler("no delivery attempts configured"));

        if let (Some(address), Some(transport)) = (&self.dead_letter_address, dead_letter) {
            let faulted = ctx
                .envelope
                .with_header(names::FAULT_REASON, "consumer-fault")
                .with_header(names::FAULT_MESSAGE, err.to_string())
                .with_header(names::REDELIVERY_COUNT, attempts.to_string());
            match transport.send(faulted).await {
                Ok(()) => {
                    warn!(
                        message_id = %ctx.envelope.message_id(),
                        dead_letter = %address,
                        "message dead-lettered after {attempts} attempt(s)"
                    );
                    return Ok(());
                }
                Err(forward_err) => {
                    // Leave the message for redelivery rather than lose it.
                    warn!(
                        message_id = %ctx.envelope.message_id(),
                        error = %forward_err,
                        "dead-letter forward failed, leaving message for retry"
                    );
                    return Err(err);
                }
            }
        }

        Err(err)
    }
}
