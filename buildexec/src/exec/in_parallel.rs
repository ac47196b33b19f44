//! Concurrent execution of sibling steps.

use super::{panic_message, BoxStep, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// Reason given to siblings cancelled by a fail-fast failure.
const FAIL_FAST_REASON: &str = "a sibling step failed";

/// Runs steps concurrently, at most `limit` at a time.
#[derive(Debug)]
pub struct InParallelStep {
    steps: Vec<BoxStep>,
    limit: usize,
    fail_fast: bool,
}

impl InParallelStep {
    /// Creates the step. A `limit` of 0 runs every step at once.
    #[must_use]
    pub fn new(steps: Vec<BoxStep>, limit: usize, fail_fast: bool) -> Self {
        Self {
            steps,
            limit,
            fail_fast,
        }
    }
}

/// Runs one sibling, turning a panic into an error.
async fn run_sibling(step: &BoxStep, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
    match AssertUnwindSafe(step.run(ctx, state)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "parallel step panicked");
            Err(ExecError::Panicked(message))
        }
    }
}

#[async_trait]
impl Step for InParallelStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let limit = if self.limit == 0 {
            self.steps.len()
        } else {
            self.limit
        };

        let group = ctx.child_token();
        let mut pending = self.steps.iter();
        let mut running = FuturesUnordered::new();
        for step in pending.by_ref().take(limit) {
            running.push(run_sibling(step, &group, state));
        }

        let mut succeeded = true;
        let mut errors = Vec::new();

        while let Some(result) = running.next().await {
            match result {
                Ok(true) => {}
                Ok(false) => succeeded = false,
                Err(err) => {
                    succeeded = false;
                    if !err.is_cancelled() {
                        errors.push(err);
                    }
                }
            }

            if !succeeded && self.fail_fast && !group.is_cancelled() {
                debug!("cancelling parallel siblings");
                group.cancel(FAIL_FAST_REASON);
            }

            if group.is_cancelled() {
                continue;
            }
            if let Some(step) = pending.next() {
                running.push(run_sibling(step, &group, state));
            }
        }

        ctx.check()?;

        match errors.len() {
            0 => Ok(succeeded),
            1 => Err(errors.remove(0)),
            _ => Err(ExecError::Multiple(errors)),
        }
    }
}
