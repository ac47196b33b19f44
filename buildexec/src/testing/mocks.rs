//! Scripted steps and a recording leaf factory.

use crate::builder::CoreStepFactory;
use crate::cancellation::CancellationToken;
use crate::db::Build;
use crate::delegates::DelegateFactory;
use crate::errors::{ExecError, Result};
use crate::exec::{BoxStep, ContainerMetadata, RunState, Step, StepMetadata};
use crate::plan::{Plan, PlanId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ErrorFn = Arc<dyn Fn() -> ExecError + Send + Sync>;

#[derive(Clone)]
enum Outcome {
    Succeed,
    Fail,
    Error(ErrorFn),
}

/// A step with a scripted outcome that counts its runs.
///
/// Clones share counters, so keep a clone to inspect after boxing one.
#[derive(Clone)]
pub struct FakeStep {
    outcome: Outcome,
    delay: Option<Duration>,
    runs: Arc<AtomicUsize>,
    cancelled_runs: Arc<AtomicUsize>,
}

impl FakeStep {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            delay: None,
            runs: Arc::new(AtomicUsize::new(0)),
            cancelled_runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A step that succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new(Outcome::Succeed)
    }

    /// A step that completes without succeeding.
    #[must_use]
    pub fn failing() -> Self {
        Self::new(Outcome::Fail)
    }

    /// A step that errors with `message`.
    #[must_use]
    pub fn erroring(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_error(move || ExecError::step(message.clone()))
    }

    /// A step that reports being interrupted by an abort.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::with_error(|| ExecError::Cancelled("aborted".to_string()))
    }

    /// A step that errors with whatever `error` builds.
    #[must_use]
    pub fn with_error(error: impl Fn() -> ExecError + Send + Sync + 'static) -> Self {
        Self::new(Outcome::Error(Arc::new(error)))
    }

    /// Sleeps for `delay` before resolving.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times the step ran.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// How many runs started with an already cancelled token.
    #[must_use]
    pub fn cancelled_runs(&self) -> usize {
        self.cancelled_runs.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for FakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            Outcome::Succeed => "succeed",
            Outcome::Fail => "fail",
            Outcome::Error(_) => "error",
        };
        f.debug_struct("FakeStep")
            .field("outcome", &outcome)
            .field("runs", &self.runs())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for FakeStep {
    async fn run(&self, ctx: &CancellationToken, _state: &RunState) -> Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if ctx.is_cancelled() {
            self.cancelled_runs.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.outcome {
            Outcome::Succeed => Ok(true),
            Outcome::Fail => Ok(false),
            Outcome::Error(error) => Err(error()),
        }
    }
}

/// A step that runs until its token is cancelled.
#[derive(Debug, Clone, Default)]
pub struct BlockingStep {
    cancel_error: Option<String>,
    reason: Arc<Mutex<Option<String>>>,
}

impl BlockingStep {
    /// Creates a step that returns the cancellation once cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an ordinary error instead of the cancellation.
    #[must_use]
    pub fn erroring_on_cancel(mut self, message: impl Into<String>) -> Self {
        self.cancel_error = Some(message.into());
        self
    }

    /// The reason the step was cancelled with, once it has been.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

#[async_trait]
impl Step for BlockingStep {
    async fn run(&self, ctx: &CancellationToken, _state: &RunState) -> Result<bool> {
        ctx.cancelled().await;
        *self.reason.lock() = ctx.reason();

        match &self.cancel_error {
            Some(message) => Err(ExecError::step(message.clone())),
            None => ctx.check().map(|()| false),
        }
    }
}

/// A step that panics.
#[derive(Debug, Clone)]
pub struct PanickingStep {
    message: String,
}

impl PanickingStep {
    /// Creates a step panicking with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Step for PanickingStep {
    #[allow(clippy::panic)]
    async fn run(&self, _ctx: &CancellationToken, _state: &RunState) -> Result<bool> {
        std::panic::panic_any(self.message.clone())
    }
}

/// A step recording the local vars it sees on each run.
#[derive(Debug, Clone)]
pub struct VarProbe {
    names: Vec<String>,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl VarProbe {
    /// Creates a probe reading the named local vars.
    #[must_use]
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(ToString::to_string).collect(),
            seen: Arc::default(),
        }
    }

    /// One array per run, holding each var's value or null.
    #[must_use]
    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Step for VarProbe {
    async fn run(&self, _ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let values = self
            .names
            .iter()
            .map(|name| state.local_var(name).unwrap_or(Value::Null))
            .collect();
        self.seen.lock().push(Value::Array(values));
        Ok(true)
    }
}

/// One leaf requested from a [`FakeStepFactory`].
#[derive(Debug, Clone)]
pub struct FactoryCall {
    /// Plan kind of the leaf, e.g. `"task"`.
    pub kind: &'static str,
    /// The plan node, with its attempt path.
    pub plan: Plan,
    /// Step metadata, for leaves that get it.
    pub metadata: Option<StepMetadata>,
    /// Container metadata, for leaves that run on a worker.
    pub container: Option<ContainerMetadata>,
}

type StepFn = Arc<dyn Fn() -> BoxStep + Send + Sync>;

/// A [`CoreStepFactory`] that records every leaf and hands out scripted
/// steps, succeeding ones unless told otherwise.
#[derive(Clone, Default)]
pub struct FakeStepFactory {
    calls: Arc<Mutex<Vec<FactoryCall>>>,
    steps: Arc<Mutex<HashMap<PlanId, StepFn>>>,
}

impl fmt::Debug for FakeStepFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeStepFactory")
            .field("calls", &self.calls.lock().len())
            .field("scripted", &self.steps.lock().len())
            .finish()
    }
}

impl FakeStepFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves a clone of `step` for every leaf with ID `plan_id`.
    #[must_use]
    pub fn with_step<S>(self, plan_id: impl Into<PlanId>, step: S) -> Self
    where
        S: Step + Clone + 'static,
    {
        let serve: StepFn = Arc::new(move || Box::new(step.clone()) as BoxStep);
        self.steps.lock().insert(plan_id.into(), serve);
        self
    }

    /// Every leaf requested so far.
    #[must_use]
    pub fn calls(&self) -> Vec<FactoryCall> {
        self.calls.lock().clone()
    }

    /// How many leaves of `kind` were requested.
    #[must_use]
    pub fn count(&self, kind: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    /// Container metadata of the first leaf with ID `plan_id`.
    #[must_use]
    pub fn container_for(&self, plan_id: &str) -> Option<ContainerMetadata> {
        self.calls
            .lock()
            .iter()
            .find(|c| c.plan.id.as_str() == plan_id)
            .and_then(|c| c.container.clone())
    }

    fn record(
        &self,
        plan: &Plan,
        metadata: Option<StepMetadata>,
        container: Option<ContainerMetadata>,
    ) -> BoxStep {
        let kind = plan.step.as_ref().map_or("empty", |step| step.kind());
        self.calls.lock().push(FactoryCall {
            kind,
            plan: plan.clone(),
            metadata,
            container,
        });

        let serve = self.steps.lock().get(&plan.id).cloned();
        match serve {
            Some(serve) => serve(),
            None => Box::new(FakeStep::succeeding()),
        }
    }
}

impl CoreStepFactory for FakeStepFactory {
    fn get_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), Some(container))
    }

    fn put_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), Some(container))
    }

    fn task_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), Some(container))
    }

    fn run_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), Some(container))
    }

    fn check_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), Some(container))
    }

    fn set_pipeline_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), None)
    }

    fn load_var_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        _delegates: DelegateFactory,
    ) -> BoxStep {
        self.record(plan, Some(metadata), None)
    }

    fn artifact_input_step(&self, plan: &Plan, _build: Arc<dyn Build>) -> BoxStep {
        self.record(plan, None, None)
    }

    fn artifact_output_step(&self, plan: &Plan, _build: Arc<dyn Build>) -> BoxStep {
        self.record(plan, None, None)
    }
}
