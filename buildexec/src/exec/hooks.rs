//! Steps that run a hook depending on how another step ended.

use super::{BoxStep, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use async_trait::async_trait;
use tracing::warn;

/// Combines a step error with a hook error. A cancelled step keeps its
/// cancellation so the build still ends up aborted.
fn combine(step_err: ExecError, hook_err: ExecError) -> ExecError {
    if step_err.is_cancelled() {
        warn!(error = %hook_err, "hook errored after cancellation");
        return step_err;
    }
    ExecError::Multiple(vec![step_err, hook_err])
}

/// Token for a hook that must run even though the build was cancelled.
fn hook_token(ctx: &CancellationToken) -> CancellationToken {
    if ctx.is_cancelled() {
        CancellationToken::new()
    } else {
        ctx.clone()
    }
}

macro_rules! hook_step {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            step: BoxStep,
            hook: BoxStep,
        }

        impl $name {
            /// Wraps `step` with `hook`.
            #[must_use]
            pub fn new(step: BoxStep, hook: BoxStep) -> Self {
                Self { step, hook }
            }
        }
    };
}

hook_step!(
    /// Runs the hook only if the step succeeded; the result is the hook's.
    OnSuccessStep
);
hook_step!(
    /// Runs the hook only if the step completed without succeeding.
    OnFailureStep
);
hook_step!(
    /// Runs the hook only if the step was cancelled.
    OnAbortStep
);
hook_step!(
    /// Runs the hook only if the step errored for a reason other than cancellation.
    OnErrorStep
);
hook_step!(
    /// Always runs the hook; succeeds only if both succeed.
    EnsureStep
);

#[async_trait]
impl Step for OnSuccessStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        if !self.step.run(ctx, state).await? {
            return Ok(false);
        }
        self.hook.run(ctx, state).await
    }
}

#[async_trait]
impl Step for OnFailureStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        if self.step.run(ctx, state).await? {
            return Ok(true);
        }
        self.hook.run(ctx, state).await?;
        Ok(false)
    }
}

#[async_trait]
impl Step for OnAbortStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        match self.step.run(ctx, state).await {
            Err(err) if err.is_cancelled() => {
                // The build context is already cancelled.
                if let Err(hook_err) = self.hook.run(&CancellationToken::new(), state).await {
                    return Err(combine(err, hook_err));
                }
                Err(err)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Step for OnErrorStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        match self.step.run(ctx, state).await {
            Err(err) if !err.is_cancelled() => {
                if let Err(hook_err) = self.hook.run(ctx, state).await {
                    return Err(combine(err, hook_err));
                }
                Err(err)
            }
            other => other,
        }
    }
}

#[async_trait]
impl Step for EnsureStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let step_result = self.step.run(ctx, state).await;
        let hook_result = self.hook.run(&hook_token(ctx), state).await;

        match (step_result, hook_result) {
            (Ok(step_ok), Ok(hook_ok)) => Ok(step_ok && hook_ok),
            (Err(step_err), Err(hook_err)) => Err(combine(step_err, hook_err)),
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        }
    }
}
