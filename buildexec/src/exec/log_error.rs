//! Decorators that record step errors on the build log.

use super::timeout::TIMEOUT_REASON;
use super::{BoxStep, BuildStepDelegateFactory, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Message logged for a step interrupted by an abort.
pub const ABORTED_LOG_MESSAGE: &str = "interrupted";

/// Message logged for a step interrupted by a timeout.
pub const TIMEOUT_LOG_MESSAGE: &str = "timeout exceeded";

/// Saves an error event whenever the wrapped step errors.
#[derive(Debug)]
pub struct LogErrorStep {
    step: BoxStep,
    delegates: Arc<dyn BuildStepDelegateFactory>,
}

impl LogErrorStep {
    /// Wraps `step`.
    #[must_use]
    pub fn new(step: BoxStep, delegates: Arc<dyn BuildStepDelegateFactory>) -> Self {
        Self { step, delegates }
    }
}

#[async_trait]
impl Step for LogErrorStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let result = self.step.run(ctx, state).await;

        if let Err(err) = &result {
            let message = match err.cancel_reason() {
                Some(TIMEOUT_REASON) => TIMEOUT_LOG_MESSAGE.to_string(),
                Some(_) => ABORTED_LOG_MESSAGE.to_string(),
                None => err.to_string(),
            };
            self.delegates
                .build_step_delegate(state)
                .errored(&message)
                .await;
        }

        result
    }
}

/// Turns a lost worker into a request to rerun the whole build.
#[derive(Debug)]
pub struct RetryErrorStep {
    step: BoxStep,
    delegates: Arc<dyn BuildStepDelegateFactory>,
}

impl RetryErrorStep {
    /// Wraps `step`.
    #[must_use]
    pub fn new(step: BoxStep, delegates: Arc<dyn BuildStepDelegateFactory>) -> Self {
        Self { step, delegates }
    }
}

#[async_trait]
impl Step for RetryErrorStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        match self.step.run(ctx, state).await {
            Err(err) if err.is_worker_disappeared() => {
                info!(error = %err, "step will be retried");
                self.delegates
                    .build_step_delegate(state)
                    .errored(&format!("{err}, will retry ..."))
                    .await;
                Err(ExecError::Retriable(Box::new(err)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Event;
    use crate::exec::TimeoutStep;
    use crate::testing::{delegate_factory, run_state, BlockingStep, FakeBuild, FakeStep};

    fn factory(build: &FakeBuild) -> Arc<dyn BuildStepDelegateFactory> {
        Arc::new(delegate_factory(build, "some-plan-id"))
    }

    fn error_messages(build: &FakeBuild) -> Vec<String> {
        build
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_success_logs_nothing() {
        let build = FakeBuild::new(1);
        let step = LogErrorStep::new(Box::new(FakeStep::failing()), factory(&build));
        assert!(!step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        assert!(build.events().is_empty());
    }

    #[tokio::test]
    async fn test_error_message_is_logged() {
        let build = FakeBuild::new(1);
        let step = LogErrorStep::new(Box::new(FakeStep::erroring("disaster")), factory(&build));
        assert!(step.run(&CancellationToken::new(), &run_state()).await.is_err());
        assert_eq!(error_messages(&build), vec!["disaster"]);
    }

    #[tokio::test]
    async fn test_abort_is_logged_as_interrupted() {
        let build = FakeBuild::new(1);
        let step = LogErrorStep::new(Box::new(FakeStep::cancelled()), factory(&build));
        assert!(step.run(&CancellationToken::new(), &run_state()).await.is_err());
        assert_eq!(error_messages(&build), vec![ABORTED_LOG_MESSAGE]);
    }

    #[tokio::test]
    async fn test_timeout_is_logged() {
        let build = FakeBuild::new(1);
        let leaf = LogErrorStep::new(Box::new(BlockingStep::new()), factory(&build));
        let step = TimeoutStep::new(Box::new(leaf), "10ms");

        assert!(!step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        assert_eq!(error_messages(&build), vec![TIMEOUT_LOG_MESSAGE]);
    }

    #[tokio::test]
    async fn test_worker_disappeared_becomes_retriable() {
        let build = FakeBuild::new(1);
        let step = RetryErrorStep::new(
            Box::new(FakeStep::with_error(|| ExecError::WorkerDisappeared("w1".into()))),
            factory(&build),
        );

        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            error_messages(&build),
            vec!["worker disappeared: w1, will retry ..."]
        );
    }

    #[tokio::test]
    async fn test_other_errors_are_untouched() {
        let build = FakeBuild::new(1);
        let step = RetryErrorStep::new(Box::new(FakeStep::erroring("boom")), factory(&build));
        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert!(!err.is_retriable());
        assert!(build.events().is_empty());
    }
}
