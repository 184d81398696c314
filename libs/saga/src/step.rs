//! A single compensable step.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Failure of a step's execute or compensate operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    pub fn new(msg: impl Into<String>) -> Self {
        StepError(msg.into())
    }
}

impl From<&str> for StepError {
    fn from(msg: &str) -> Self {
        StepError(msg.to_string())
    }
}

impl From<String> for StepError {
    fn from(msg: String) -> Self {
        StepError(msg)
    }
}

type StepFn<S> = Arc<dyn Fn(Arc<S>) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// A named pair of async operations over a shared typed state.
///
/// Immutable once constructed; held in declared order for the duration of
/// one execution. The execute and compensate closures receive the shared
/// state and use its interior mutability to record their effects.
pub struct SagaStep<S> {
    name: String,
    execute: StepFn<S>,
    compensate: StepFn<S>,
}

impl<S: Send + Sync + 'static> SagaStep<S> {
    pub fn new<E, EF, C, CF>(name: impl Into<String>, execute: E, compensate: C) -> Self
    where
        E: Fn(Arc<S>) -> EF + Send + Sync + 'static,
        EF: Future<Output = Result<(), StepError>> + Send + 'static,
        C: Fn(Arc<S>) -> CF + Send + Sync + 'static,
        CF: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |state| Box::pin(execute(state))),
            compensate: Arc::new(move |state| Box::pin(compensate(state))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run_execute(&self, state: Arc<S>) -> BoxFuture<'static, Result<(), StepError>> {
        (self.execute)(state)
    }

    pub(crate) fn run_compensate(
        &self,
        state: Arc<S>,
    ) -> BoxFuture<'static, Result<(), StepError>> {
        (self.compensate)(state)
    }
}

impl<S> std::fmt::Debug for SagaStep<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep").field("name", &self.name).finish()
    }
}
