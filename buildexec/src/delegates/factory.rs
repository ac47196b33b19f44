//! Creates the delegate for each step of a build.

use super::build_step::BuildDelegate;
use super::check::CheckStepDelegate;
use super::get_put::{GetStepDelegate, PutStepDelegate};
use super::image::{ArtifactSourcer, VolumeSourcer};
use super::policy::{NoopPolicyChecker, PolicyChecker};
use super::rate_limiter::{NoopRateLimiter, RateLimiter};
use super::set_pipeline::SetPipelineDelegate;
use super::task::TaskStepDelegate;
use crate::config::EngineConfig;
use crate::db::Build;
use crate::exec::{BuildStepDelegate, BuildStepDelegateFactory, RunState};
use crate::plan::{CheckPlan, PlanId};
use crate::utils::{Clock, SystemClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hands out delegates for one step of a build.
#[derive(Clone)]
pub struct DelegateFactory {
    build: Arc<dyn Build>,
    plan_id: PlanId,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn PolicyChecker>,
    sourcer: Arc<dyn ArtifactSourcer>,
    limiter: Arc<dyn RateLimiter>,
    default_check_interval: Duration,
    check_lock_retry_interval: Duration,
    log_flush_interval: Duration,
}

impl DelegateFactory {
    /// Creates a factory for the step `plan_id` of `build`.
    #[must_use]
    pub fn new(build: Arc<dyn Build>, plan_id: impl Into<PlanId>) -> Self {
        let config = EngineConfig::default();
        Self {
            build,
            plan_id: plan_id.into(),
            clock: Arc::new(SystemClock),
            policy: Arc::new(NoopPolicyChecker),
            sourcer: Arc::new(VolumeSourcer),
            limiter: Arc::new(NoopRateLimiter),
            default_check_interval: config.default_check_interval,
            check_lock_retry_interval: config.check_lock_retry_interval,
            log_flush_interval: config.log_flush_interval,
        }
    }

    /// Applies the intervals of an engine config.
    #[must_use]
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.default_check_interval = config.default_check_interval;
        self.check_lock_retry_interval = config.check_lock_retry_interval;
        self.log_flush_interval = config.log_flush_interval;
        self
    }

    /// Sets the clock used for timestamps and waits.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the policy checker.
    #[must_use]
    pub fn with_policy_checker(mut self, policy: Arc<dyn PolicyChecker>) -> Self {
        self.policy = policy;
        self
    }

    /// Sets how fetched images become streamable sources.
    #[must_use]
    pub fn with_artifact_sourcer(mut self, sourcer: Arc<dyn ArtifactSourcer>) -> Self {
        self.sourcer = sourcer;
        self
    }

    /// Sets the limiter periodic checks wait on.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Returns a copy of this factory for another step of the same build.
    #[must_use]
    pub fn for_plan(&self, plan_id: impl Into<PlanId>) -> Self {
        Self {
            plan_id: plan_id.into(),
            ..self.clone()
        }
    }

    /// The step this factory creates delegates for.
    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// The base delegate.
    #[must_use]
    pub fn build_delegate(&self, state: &RunState) -> BuildDelegate {
        BuildDelegate::new(
            Arc::clone(&self.build),
            self.plan_id.clone(),
            state.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.policy),
            Arc::clone(&self.sourcer),
        )
        .with_flush_interval(self.log_flush_interval)
    }

    /// A delegate for a task step.
    #[must_use]
    pub fn task_delegate(&self, state: &RunState) -> TaskStepDelegate {
        TaskStepDelegate::new(self.build_delegate(state))
    }

    /// A delegate for a get step.
    #[must_use]
    pub fn get_delegate(&self, state: &RunState) -> GetStepDelegate {
        GetStepDelegate::new(self.build_delegate(state))
    }

    /// A delegate for a put step.
    #[must_use]
    pub fn put_delegate(&self, state: &RunState) -> PutStepDelegate {
        PutStepDelegate::new(self.build_delegate(state))
    }

    /// A delegate for the check step `plan`.
    #[must_use]
    pub fn check_delegate(&self, state: &RunState, plan: CheckPlan) -> CheckStepDelegate {
        CheckStepDelegate::new(
            self.build_delegate(state),
            plan,
            Arc::clone(&self.limiter),
            self.default_check_interval,
            self.check_lock_retry_interval,
        )
    }

    /// A delegate for a set_pipeline step.
    #[must_use]
    pub fn set_pipeline_step_delegate(&self, state: &RunState) -> SetPipelineDelegate {
        SetPipelineDelegate::new(self.build_delegate(state))
    }
}

impl BuildStepDelegateFactory for DelegateFactory {
    fn build_step_delegate(&self, state: &RunState) -> Box<dyn BuildStepDelegate> {
        Box::new(self.build_delegate(state))
    }
}

impl fmt::Debug for DelegateFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateFactory")
            .field("build_id", &self.build.id())
            .field("plan_id", &self.plan_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Event;
    use crate::testing::{run_state, FakeBuild};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_delegates_write_to_their_plan() {
        let build = FakeBuild::new(1);
        let factory = DelegateFactory::new(Arc::new(build.clone()), "a");
        let other = factory.for_plan("b");

        factory.build_step_delegate(&run_state()).starting().await;
        other.task_delegate(&run_state()).starting().await;

        let origins: Vec<_> = build
            .events()
            .iter()
            .map(|e| e.origin().id.to_string())
            .collect();
        assert_eq!(origins, vec!["a", "b"]);
        assert_eq!(other.plan_id().as_str(), "b");
    }

    #[test]
    fn test_config_intervals_are_applied() {
        let config = EngineConfig::default().with_default_check_interval(Duration::from_secs(5));
        let factory = DelegateFactory::new(Arc::new(FakeBuild::new(1)), "a").with_config(&config);
        assert_eq!(factory.default_check_interval, Duration::from_secs(5));
        assert_eq!(factory.check_lock_retry_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_build_step_delegate_is_boxed_base_delegate() {
        let build = FakeBuild::new(1);
        let factory = DelegateFactory::new(Arc::new(build.clone()), "a");
        factory.build_step_delegate(&run_state()).finished(true).await;
        assert!(matches!(build.events()[..], [Event::Finish { succeeded: true, .. }]));
    }
}
