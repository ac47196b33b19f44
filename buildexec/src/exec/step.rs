//! The executable step abstraction.

use super::RunState;
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::plan::Plan;
use async_trait::async_trait;
use std::fmt::Debug;

/// A compiled, runnable node of the plan tree.
///
/// `Ok(true)` means the step succeeded and `Ok(false)` that it ran to
/// completion without succeeding. An `Err` means the step errored, and
/// [`crate::errors::ExecError::is_cancelled`] tells aborts apart from
/// real failures.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Runs the step to completion.
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool>;
}

/// An owned, type-erased step.
pub type BoxStep = Box<dyn Step>;

/// Compiles plans into steps for one build.
pub trait Stepper: Send + Sync {
    /// Compiles `plan` and everything below it.
    fn step_for(&self, plan: &Plan) -> BoxStep;
}

/// A step that does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityStep;

#[async_trait]
impl Step for IdentityStep {
    async fn run(&self, _ctx: &CancellationToken, _state: &RunState) -> Result<bool> {
        Ok(true)
    }
}
