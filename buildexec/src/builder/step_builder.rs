//! Compiles plan trees into steps.

use super::core_factory::CoreStepFactory;
use crate::config::EngineConfig;
use crate::db::Build;
use crate::delegates::{
    ArtifactSourcer, DelegateFactory, NoopPolicyChecker, NoopRateLimiter, PolicyChecker,
    RateLimiter, VolumeSourcer,
};
use crate::errors::{ExecError, Result};
use crate::exec::{
    AcrossStep, BoxStep, BuildStepDelegateFactory, ContainerMetadata, ContainerType, EnsureStep,
    IdentityStep, InParallelStep, LogErrorStep, OnAbortStep, OnErrorStep, OnFailureStep,
    OnSuccessStep, RetryErrorStep, RetryStep, ScopedStep, StepMetadata, Stepper, TimeoutStep,
    TryStep,
};
use crate::plan::{HookPlan, Plan, PlanStep};
use crate::utils::{Clock, SystemClock};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The plan schema this builder compiles.
pub const SUPPORTED_SCHEMA: &str = "exec.v2";

/// Turns plans into step trees, delegating leaves to a [`CoreStepFactory`].
#[derive(Clone)]
pub struct StepBuilder {
    core: Arc<dyn CoreStepFactory>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn PolicyChecker>,
    sourcer: Arc<dyn ArtifactSourcer>,
    limiter: Arc<dyn RateLimiter>,
}

impl StepBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(core: Arc<dyn CoreStepFactory>, config: EngineConfig) -> Self {
        Self {
            core,
            config,
            clock: Arc::new(SystemClock),
            policy: Arc::new(NoopPolicyChecker),
            sourcer: Arc::new(VolumeSourcer),
            limiter: Arc::new(NoopRateLimiter),
        }
    }

    /// Sets the clock handed to delegates.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the policy checker handed to delegates.
    #[must_use]
    pub fn with_policy_checker(mut self, policy: Arc<dyn PolicyChecker>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the image sourcer handed to delegates.
    #[must_use]
    pub fn with_artifact_sourcer(mut self, sourcer: Arc<dyn ArtifactSourcer>) -> Self {
        self.sourcer = sourcer;
        self
    }

    /// Sets the rate limiter periodic checks wait on.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// The configuration the builder was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns a stepper for `build`, refusing builds of any other schema.
    pub fn stepper_for_build(&self, build: Arc<dyn Build>) -> Result<BuildStepper> {
        let schema = build.schema();
        if schema != SUPPORTED_SCHEMA {
            debug!(build_id = build.id(), schema = %schema, "schema-not-supported");
            return Err(ExecError::SchemaNotSupported);
        }

        Ok(BuildStepper {
            builder: self.clone(),
            build,
        })
    }

    fn delegate_factory(&self, build: &Arc<dyn Build>, plan: &Plan) -> DelegateFactory {
        DelegateFactory::new(Arc::clone(build), plan.id.clone())
            .with_config(&self.config)
            .with_clock(Arc::clone(&self.clock))
            .with_policy_checker(Arc::clone(&self.policy))
            .with_artifact_sourcer(Arc::clone(&self.sourcer))
            .with_rate_limiter(Arc::clone(&self.limiter))
    }

    fn step_metadata(&self, build: &Arc<dyn Build>, expose_created_by: bool) -> StepMetadata {
        StepMetadata::for_build(build.as_ref(), &self.config.external_url, expose_created_by)
    }

    fn build_step(&self, build: &Arc<dyn Build>, plan: &Plan) -> BoxStep {
        let Some(step) = &plan.step else {
            return Box::new(IdentityStep);
        };

        match step {
            PlanStep::InParallel(parallel) => {
                let steps = parallel
                    .steps
                    .iter()
                    .map(|inner| self.build_step(build, &inherit(plan, inner)))
                    .collect();
                Box::new(InParallelStep::new(steps, parallel.limit, parallel.fail_fast))
            }
            PlanStep::Across(across) => {
                let steps = across
                    .steps
                    .iter()
                    .map(|scoped| ScopedStep {
                        step: self.build_step(build, &inherit(plan, &scoped.step)),
                        values: scoped.values.clone(),
                    })
                    .collect();
                let delegates: Arc<dyn BuildStepDelegateFactory> =
                    Arc::new(self.delegate_factory(build, plan));
                let step = AcrossStep::new(
                    across.vars.clone(),
                    steps,
                    across.fail_fast,
                    Arc::clone(&delegates),
                );
                Box::new(LogErrorStep::new(Box::new(step), delegates))
            }
            PlanStep::Do(plans) => plans.iter().rev().fold(
                Box::new(IdentityStep) as BoxStep,
                |next, inner| {
                    let step = self.build_step(build, &inherit(plan, inner));
                    Box::new(OnSuccessStep::new(step, next))
                },
            ),
            PlanStep::Timeout(timeout) => {
                let step = self.build_step(build, &inherit(plan, &timeout.step));
                Box::new(TimeoutStep::new(step, timeout.duration.clone()))
            }
            PlanStep::Try(attempt) => {
                let step = self.build_step(build, &inherit(plan, &attempt.step));
                Box::new(TryStep::new(step))
            }
            PlanStep::OnAbort(hook) => {
                let (step, next) = self.build_hook(build, plan, hook);
                Box::new(OnAbortStep::new(step, next))
            }
            PlanStep::OnError(hook) => {
                let (step, next) = self.build_hook(build, plan, hook);
                Box::new(OnErrorStep::new(step, next))
            }
            PlanStep::OnSuccess(hook) => {
                let (step, next) = self.build_hook(build, plan, hook);
                Box::new(OnSuccessStep::new(step, next))
            }
            PlanStep::OnFailure(hook) => {
                let (step, next) = self.build_hook(build, plan, hook);
                Box::new(OnFailureStep::new(step, next))
            }
            PlanStep::Ensure(hook) => {
                let (step, next) = self.build_hook(build, plan, hook);
                Box::new(EnsureStep::new(step, next))
            }
            PlanStep::Retry(attempts) => {
                let steps = attempts
                    .iter()
                    .zip(1_u32..)
                    .map(|(inner, index)| {
                        let mut attempt = inner.clone();
                        attempt.attempts = plan.attempts.clone();
                        attempt.attempts.push(index);
                        self.build_step(build, &attempt)
                    })
                    .collect();
                Box::new(RetryStep::new(steps))
            }
            PlanStep::Run(run) => {
                self.container_leaf(build, plan, ContainerType::Run, &run.message, false)
            }
            PlanStep::Task(task) => {
                self.container_leaf(build, plan, ContainerType::Task, &task.name, false)
            }
            PlanStep::Check(check) => {
                self.container_leaf(build, plan, ContainerType::Check, &check.name, false)
            }
            PlanStep::Get(get) => {
                self.container_leaf(build, plan, ContainerType::Get, &get.name, false)
            }
            PlanStep::Put(put) => self.container_leaf(
                build,
                plan,
                ContainerType::Put,
                &put.name,
                put.expose_build_created_by,
            ),
            PlanStep::SetPipeline(_) => {
                let delegates = self.delegate_factory(build, plan);
                let step = self.core.set_pipeline_step(
                    plan,
                    self.step_metadata(build, false),
                    delegates.clone(),
                );
                log_errors(step, delegates)
            }
            PlanStep::LoadVar(_) => {
                let delegates = self.delegate_factory(build, plan);
                let step =
                    self.core
                        .load_var_step(plan, self.step_metadata(build, false), delegates.clone());
                log_errors(step, delegates)
            }
            PlanStep::ArtifactInput(_) => log_errors(
                self.core.artifact_input_step(plan, Arc::clone(build)),
                self.delegate_factory(build, plan),
            ),
            PlanStep::ArtifactOutput(_) => log_errors(
                self.core.artifact_output_step(plan, Arc::clone(build)),
                self.delegate_factory(build, plan),
            ),
        }
    }

    fn build_hook(&self, build: &Arc<dyn Build>, plan: &Plan, hook: &HookPlan) -> (BoxStep, BoxStep) {
        (
            self.build_step(build, &inherit(plan, &hook.step)),
            self.build_step(build, &inherit(plan, &hook.next)),
        )
    }

    /// Compiles a leaf that runs in a container on a worker.
    fn container_leaf(
        &self,
        build: &Arc<dyn Build>,
        plan: &Plan,
        container_type: ContainerType,
        name: &str,
        expose_created_by: bool,
    ) -> BoxStep {
        let container =
            ContainerMetadata::for_step(build.as_ref(), container_type, name, &plan.attempts);
        let metadata = self.step_metadata(build, expose_created_by);
        let delegates = self.delegate_factory(build, plan);

        let step = match container_type {
            ContainerType::Get => self.core.get_step(plan, metadata, container, delegates.clone()),
            ContainerType::Put => self.core.put_step(plan, metadata, container, delegates.clone()),
            ContainerType::Task => self.core.task_step(plan, metadata, container, delegates.clone()),
            ContainerType::Check => {
                self.core.check_step(plan, metadata, container, delegates.clone())
            }
            ContainerType::Run => self.core.run_step(plan, metadata, container, delegates.clone()),
        };

        let step = log_errors(step, delegates.clone());
        if self.config.rerun_on_worker_disappeared {
            Box::new(RetryErrorStep::new(step, Arc::new(delegates)))
        } else {
            step
        }
    }
}

impl fmt::Debug for StepBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Compiles plans for one build.
#[derive(Clone)]
pub struct BuildStepper {
    builder: StepBuilder,
    build: Arc<dyn Build>,
}

impl Stepper for BuildStepper {
    fn step_for(&self, plan: &Plan) -> BoxStep {
        self.builder.build_step(&self.build, plan)
    }
}

impl fmt::Debug for BuildStepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildStepper")
            .field("build_id", &self.build.id())
            .finish_non_exhaustive()
    }
}

/// Copies `inner` with the attempt path of its parent.
fn inherit(parent: &Plan, inner: &Plan) -> Plan {
    let mut plan = inner.clone();
    plan.attempts = parent.attempts.clone();
    plan
}

fn log_errors(step: BoxStep, delegates: DelegateFactory) -> BoxStep {
    Box::new(LogErrorStep::new(step, Arc::new(delegates)))
}
