//! Deadline enforcement for a step.

use super::{BoxStep, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::utils::parse_duration;
use async_trait::async_trait;
use tracing::info;

/// Cancellation reason used when a deadline passes.
pub const TIMEOUT_REASON: &str = "timeout exceeded";

/// Cancels the inner step once its duration elapses.
///
/// Hitting the deadline makes the step fail rather than error, unless the
/// inner step errored for some other reason on its way out.
#[derive(Debug)]
pub struct TimeoutStep {
    step: BoxStep,
    duration: String,
}

impl TimeoutStep {
    /// Wraps `step` with a Go-style duration string such as `"1h30m"`.
    #[must_use]
    pub fn new(step: BoxStep, duration: impl Into<String>) -> Self {
        Self {
            step,
            duration: duration.into(),
        }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let duration = parse_duration(&self.duration)?;
        let scoped = ctx.child_token();

        let run = self.step.run(&scoped, state);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => return result,
            () = tokio::time::sleep(duration) => {
                info!(timeout = %self.duration, "step timed out");
                scoped.cancel(TIMEOUT_REASON);
                run.await
            }
        };

        match result {
            Err(err) if !err.is_cancelled() => Err(err),
            _ => {
                ctx.check()?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_state, BlockingStep, FakeStep};
    use std::time::Duration;

    #[tokio::test]
    async fn test_fast_step_keeps_its_result() {
        let step = TimeoutStep::new(Box::new(FakeStep::succeeding()), "1h");
        assert!(step.run(&CancellationToken::new(), &run_state()).await.unwrap());

        let step = TimeoutStep::new(Box::new(FakeStep::erroring("boom")), "1h");
        assert!(step.run(&CancellationToken::new(), &run_state()).await.is_err());
    }

    #[tokio::test]
    async fn test_deadline_fails_instead_of_erroring() {
        let inner = BlockingStep::new();
        let step = TimeoutStep::new(Box::new(inner.clone()), "10ms");

        let ok = step.run(&CancellationToken::new(), &run_state()).await.unwrap();
        assert!(!ok);
        assert_eq!(inner.cancel_reason().as_deref(), Some(TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn test_inner_error_after_deadline_propagates() {
        let inner = BlockingStep::new().erroring_on_cancel("cleanup failed");
        let step = TimeoutStep::new(Box::new(inner), "10ms");
        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert_eq!(err.to_string(), "cleanup failed");
    }

    #[tokio::test]
    async fn test_build_abort_is_not_a_timeout() {
        let ctx = CancellationToken::new();
        let step = TimeoutStep::new(Box::new(BlockingStep::new()), "1h");

        let aborter = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aborter.cancel("aborted");
        });

        let err = step.run(&ctx, &run_state()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.cancel_reason(), Some("aborted"));
    }

    #[tokio::test]
    async fn test_invalid_duration_errors() {
        let step = TimeoutStep::new(Box::new(FakeStep::succeeding()), "soon");
        assert!(step.run(&CancellationToken::new(), &run_state()).await.is_err());
    }
}
