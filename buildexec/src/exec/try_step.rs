//! Best-effort execution of a step.

use super::{BoxStep, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use async_trait::async_trait;
use tracing::warn;

/// Runs a step and reports success whatever happens to it.
///
/// Errors are logged and swallowed. Cancellation of the build still
/// propagates so an abort is never turned into a success.
#[derive(Debug)]
pub struct TryStep {
    step: BoxStep,
}

impl TryStep {
    /// Wraps `step`.
    #[must_use]
    pub fn new(step: BoxStep) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        match self.step.run(ctx, state).await {
            Err(err) if err.is_cancelled() && ctx.is_cancelled() => Err(err),
            Err(err) => {
                warn!(error = %err, "ignoring error from try step");
                Ok(true)
            }
            Ok(_) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_state, FakeStep};

    #[tokio::test]
    async fn test_failure_and_error_become_success() {
        for inner in [FakeStep::failing(), FakeStep::erroring("boom")] {
            let step = TryStep::new(Box::new(inner));
            assert!(step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_build_abort_propagates() {
        let ctx = CancellationToken::new();
        ctx.cancel("aborted");
        let step = TryStep::new(Box::new(FakeStep::cancelled()));
        assert!(step.run(&ctx, &run_state()).await.unwrap_err().is_cancelled());
    }
}
