//! Delegate for set_pipeline steps.

use super::build_step::{forward_build_step_delegate, BuildDelegate};
use super::policy::{PolicyInput, ACTION_SET_PIPELINE};
use crate::core::Event;
use crate::errors::{ExecError, Result};
use crate::exec::SetPipelineStepDelegate;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// Reports pipeline changes and gates them on policy.
#[derive(Debug)]
pub struct SetPipelineDelegate {
    inner: BuildDelegate,
}

impl SetPipelineDelegate {
    /// Wraps a build delegate.
    #[must_use]
    pub fn new(inner: BuildDelegate) -> Self {
        Self { inner }
    }
}

forward_build_step_delegate!(SetPipelineDelegate, inner);

#[async_trait]
impl SetPipelineStepDelegate for SetPipelineDelegate {
    async fn set_pipeline_changed(&self, changed: bool) {
        self.inner
            .save(Event::SetPipelineChanged {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                changed,
            })
            .await;
        info!(plan_id = %self.inner.plan_id, changed, "set-pipeline-changed");
    }

    async fn check_run_set_pipeline_policy(&self, config: &Value) -> Result<()> {
        if !self.inner.policy.should_check_action(ACTION_SET_PIPELINE) {
            return Ok(());
        }

        let input = PolicyInput {
            action: ACTION_SET_PIPELINE.to_string(),
            team: self.inner.build.team_name(),
            pipeline: self.inner.build.pipeline_name(),
            data: self.inner.state.credential_tracker().redact_value(config),
        };

        let result = self
            .inner
            .policy
            .check(input)
            .await
            .map_err(|err| ExecError::PolicyCheck(err.to_string()))?;

        if result.allowed {
            return Ok(());
        }
        if result.should_block {
            return Err(ExecError::PolicyCheckFailed(result.messages));
        }

        self.inner.warn_soft_policy_failure(&result.messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegates::policy::{MockPolicyChecker, PolicyResult};
    use crate::testing::{delegate_factory, run_state, FakeBuild};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn delegate(build: &FakeBuild, policy: MockPolicyChecker) -> SetPipelineDelegate {
        delegate_factory(build, "set-plan")
            .with_policy_checker(Arc::new(policy))
            .set_pipeline_step_delegate(&run_state())
    }

    #[tokio::test]
    async fn test_changed_event() {
        let build = FakeBuild::new(1);
        let mut policy = MockPolicyChecker::new();
        policy.expect_should_check_action().never();

        delegate(&build, policy).set_pipeline_changed(true).await;
        assert!(matches!(
            build.events()[..],
            [Event::SetPipelineChanged { changed: true, .. }]
        ));
    }

    #[tokio::test]
    async fn test_unchecked_action_passes() {
        let build = FakeBuild::new(1);
        let mut policy = MockPolicyChecker::new();
        policy
            .expect_should_check_action()
            .withf(|action| action == ACTION_SET_PIPELINE)
            .return_const(false);
        policy.expect_check().never();

        delegate(&build, policy)
            .check_run_set_pipeline_policy(&json!({"jobs": []}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hard_failure_blocks() {
        let build = FakeBuild::new(1);
        let mut policy = MockPolicyChecker::new();
        policy.expect_should_check_action().return_const(true);
        policy
            .expect_check()
            .returning(|_| Ok(PolicyResult::fail(true, vec!["no privileged tasks".into()])));

        let err = delegate(&build, policy)
            .check_run_set_pipeline_policy(&json!({"jobs": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::PolicyCheckFailed(ref m) if m == &vec!["no privileged tasks".to_string()]));
        assert!(build.events().is_empty());
    }

    #[tokio::test]
    async fn test_soft_failure_warns_and_passes() {
        let build = FakeBuild::new(1);
        let mut policy = MockPolicyChecker::new();
        policy.expect_should_check_action().return_const(true);
        policy
            .expect_check()
            .returning(|_| Ok(PolicyResult::fail(false, vec!["no privileged tasks".into()])));

        delegate(&build, policy)
            .check_run_set_pipeline_policy(&json!({"jobs": []}))
            .await
            .unwrap();

        let payloads: Vec<_> = build
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Log { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("no privileged tasks"));
        assert!(payloads[1].contains("WARNING: unblocking from the policy check failure"));
    }
}
