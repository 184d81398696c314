//! Forward/backward step runner.

use crate::{SagaError, SagaStatus, SagaStep, StepError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a saga is coordinated. Only orchestration and choreography are
/// executable; `Unspecified` is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SagaStyle {
    #[default]
    Unspecified,
    /// One coordinator drives every step.
    Orchestration,
    /// Steps react to each other's events.
    Choreography,
}

/// Outcome of one compensation.
#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    pub step: String,
    /// `None` when the compensation succeeded.
    pub error: Option<StepError>,
}

/// Result of a full saga execution.
#[derive(Debug, Clone)]
pub struct SagaReport {
    pub status: SagaStatus,
    /// Steps that completed, in execution order.
    pub completed: Vec<String>,
    /// The step whose execution failed, if any.
    pub failed_step: Option<(String, StepError)>,
    /// Compensation outcomes in the (reverse) order they ran.
    pub compensations: Vec<CompensationOutcome>,
}

/// Executes an ordered step sequence with automatic LIFO compensation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SagaExecutor;

impl SagaExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `steps` strictly in order over the shared state.
    ///
    /// On the first execution failure, compensations for the completed steps
    /// run in strict reverse order; a failing compensation is recorded and
    /// the remaining compensations still run. Cancellation is checked before
    /// each step, never mid-step.
    pub async fn execute<S: Send + Sync + 'static>(
        &self,
        style: SagaStyle,
        state: Arc<S>,
        steps: &[SagaStep<S>],
        cancel: &CancellationToken,
    ) -> Result<SagaReport, SagaError> {
        if style == SagaStyle::Unspecified {
            return Err(SagaError::UnsupportedStyle(style));
        }

        let mut completed: Vec<usize> = Vec::with_capacity(steps.len());
        let mut failed_step: Option<(String, StepError)> = None;

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(step = step.name(), "saga cancelled before step");
                return Err(SagaError::Cancelled);
            }
            match step.run_execute(state.clone()).await {
                Ok(()) => {
                    debug!(step = step.name(), "saga step completed");
                    completed.push(index);
                }
                Err(err) => {
                    warn!(step = step.name(), error = %err, "saga step failed, compensating");
                    failed_step = Some((step.name().to_string(), err));
                    break;
                }
            }
        }

        if failed_step.is_none() {
            info!(steps = completed.len(), "saga completed");
            return Ok(SagaReport {
                status: SagaStatus::Completed,
                completed: completed.iter().map(|&i| steps[i].name().to_string()).collect(),
                failed_step: None,
                compensations: Vec::new(),
            });
        }

        // Compensate completed steps in strict reverse order, capturing each
        // outcome rather than aborting on the first compensation failure.
        let mut compensations = Vec::with_capacity(completed.len());
        for &index in completed.iter().rev() {
            let step = &steps[index];
            let error = match step.run_compensate(state.clone()).await {
                Ok(()) => {
                    debug!(step = step.name(), "compensation succeeded");
                    None
                }
                Err(err) => {
                    warn!(step = step.name(), error = %err, "compensation failed");
                    Some(err)
                }
            };
            compensations.push(CompensationOutcome {
                step: step.name().to_string(),
                error,
            });
        }

        let status = if compensations.iter().all(|c| c.error.is_none()) {
            SagaStatus::Compensated
        } else {
            SagaStatus::Failed
        };
        info!(?status, "saga compensation finished");

        Ok(SagaReport {
            status,
            completed: completed.iter().map(|&i| steps[i].name().to_string()).collect(),
            failed_step,
            compensations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Shared log recording the observable call order.
    #[derive(Default)]
    struct Trace {
        calls: Mutex<Vec<String>>,
    }

    impl Trace {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    fn step(name: &str, execute_fails: bool, compensate_fails: bool) -> SagaStep<Trace> {
        let n1 = name.to_string();
        let n2 = name.to_string();
        SagaStep::new(
            name,
            move |trace: Arc<Trace>| {
                let name = n1.clone();
                async move {
                    trace.record(format!("exec:{name}"));
                    if execute_fails {
                        Err(StepError::new(format!("{name} exploded")))
                    } else {
                        Ok(())
                    }
                }
            },
            move |trace: Arc<Trace>| {
                let name = n2.clone();
                async move {
                    trace.record(format!("comp:{name}"));
                    if compensate_fails {
                        Err(StepError::new(format!("{name} compensation exploded")))
                    } else {
                        Ok(())
                    }
                }
            },
        )
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let trace = Arc::new(Trace::default());
        let steps = vec![
            step("one", false, false),
            step("two", false, false),
            step("three", false, false),
        ];

        let report = SagaExecutor::new()
            .execute(
                SagaStyle::Orchestration,
                trace.clone(),
                &steps,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Completed);
        assert_eq!(report.completed, vec!["one", "two", "three"]);
        assert!(report.compensations.is_empty());
        assert_eq!(trace.calls(), vec!["exec:one", "exec:two", "exec:three"]);
    }

    #[tokio::test]
    async fn test_second_of_two_steps_fails() {
        // 2 steps, step 2 throws: executed [1, 2], compensations [-1] only —
        // the failed step never completed, so its own compensation is skipped.
        let trace = Arc::new(Trace::default());
        let steps = vec![step("one", false, false), step("two", true, false)];

        let report = SagaExecutor::new()
            .execute(
                SagaStyle::Orchestration,
                trace.clone(),
                &steps,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Compensated);
        assert_eq!(report.completed, vec!["one"]);
        assert_eq!(report.failed_step.as_ref().unwrap().0, "two");
        assert_eq!(report.compensations.len(), 1);
        assert_eq!(report.compensations[0].step, "one");
        assert_eq!(trace.calls(), vec!["exec:one", "exec:two", "comp:one"]);
    }

    #[tokio::test]
    async fn test_compensations_run_in_strict_reverse_order() {
        let trace = Arc::new(Trace::default());
        let steps = vec![
            step("one", false, false),
            step("two", false, false),
            step("three", true, false),
        ];

        let report = SagaExecutor::new()
            .execute(
                SagaStyle::Choreography,
                trace.clone(),
                &steps,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Compensated);
        assert_eq!(
            trace.calls(),
            vec![
                "exec:one",
                "exec:two",
                "exec:three",
                "comp:two",
                "comp:one"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_compensation_continues_and_reports_failed() {
        let trace = Arc::new(Trace::default());
        let steps = vec![
            step("one", false, false),
            step("two", false, true), // compensation fails
            step("three", true, false),
        ];

        let report = SagaExecutor::new()
            .execute(
                SagaStyle::Orchestration,
                trace.clone(),
                &steps,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, SagaStatus::Failed);
        // Both compensations ran despite the failure of step two's.
        assert_eq!(
            trace.calls(),
            vec![
                "exec:one",
                "exec:two",
                "exec:three",
                "comp:two",
                "comp:one"
            ]
        );
        assert!(report.compensations[0].error.is_some());
        assert!(report.compensations[1].error.is_none());
    }

    #[tokio::test]
    async fn test_unspecified_style_is_rejected() {
        let trace = Arc::new(Trace::default());
        let steps: Vec<SagaStep<Trace>> = vec![];

        let err = SagaExecutor::new()
            .execute(
                SagaStyle::Unspecified,
                trace,
                &steps,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::UnsupportedStyle(_)));
    }

    #[tokio::test]
    async fn test_cancellation_is_checked_between_steps() {
        let trace = Arc::new(Trace::default());
        let cancel = CancellationToken::new();
        let cancel_after_first = cancel.clone();
        let first = SagaStep::new(
            "one",
            move |trace: Arc<Trace>| {
                let cancel = cancel_after_first.clone();
                async move {
                    trace.record("exec:one");
                    cancel.cancel();
                    Ok(())
                }
            },
            |trace: Arc<Trace>| async move {
                trace.record("comp:one");
                Ok(())
            },
        );
        let steps = vec![first, step("two", false, false)];

        let err = SagaExecutor::new()
            .execute(SagaStyle::Orchestration, trace.clone(), &steps, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SagaError::Cancelled));
        // Step two never started; cancellation is not a failure, so no
        // compensation runs either.
        assert_eq!(trace.calls(), vec!["exec:one"]);
    }
}
