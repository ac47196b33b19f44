//! Policy checks gating image use and pipeline changes.

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action name for running a step in a container image.
pub const ACTION_USE_IMAGE: &str = "UseImage";

/// Action name for a `set_pipeline` step applying a config.
pub const ACTION_SET_PIPELINE: &str = "SetPipeline";

/// What is sent to the policy agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    /// The action being performed.
    pub action: String,
    /// Team owning the build.
    pub team: String,
    /// Pipeline owning the build, empty for one-off builds.
    pub pipeline: String,
    /// Action-specific payload, credentials already redacted.
    pub data: Value,
}

/// The agent's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyResult {
    /// Whether the action passed every policy.
    pub allowed: bool,
    /// Whether a failure must stop the action. False for soft enforcement.
    pub should_block: bool,
    /// Why the action was rejected.
    pub messages: Vec<String>,
}

impl PolicyResult {
    /// A passing result.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    /// A failing result.
    #[must_use]
    pub fn fail(should_block: bool, messages: Vec<String>) -> Self {
        Self {
            allowed: false,
            should_block,
            messages,
        }
    }
}

/// Client of an external policy agent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyChecker: Send + Sync {
    /// Whether `action` is subject to policy at all.
    fn should_check_action(&self, action: &str) -> bool;

    /// Asks the agent for a verdict.
    async fn check(&self, input: PolicyInput) -> Result<PolicyResult>;
}

/// Checker used when no policy agent is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicyChecker;

#[async_trait]
impl PolicyChecker for NoopPolicyChecker {
    fn should_check_action(&self, _action: &str) -> bool {
        false
    }

    async fn check(&self, _input: PolicyInput) -> Result<PolicyResult> {
        Ok(PolicyResult::pass())
    }
}
