//! Callbacks steps use to report progress to the persistence layer.
//!
//! Step implementations live outside this crate and only see these traits.
//! The implementations backed by a build are in [`crate::delegates`].

use super::{ArtifactHandle, RunState};
use crate::cancellation::CancellationToken;
use crate::core::MetadataField;
use crate::db::{Lock, ResourceCache, ResourceConfig, ResourceConfigScope};
use crate::errors::Result;
use crate::events::EventWriter;
use crate::plan::{ImageResource, ResourceTypeConfig, TaskConfig, Version};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Process exit status reported by the runtime.
pub type ExitStatus = i32;

/// A container image resolved for a step.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// The fetched image artifact.
    pub artifact: ArtifactHandle,
    /// Location the runtime streams the image from.
    pub source: String,
    /// Whether the container runs privileged.
    pub privileged: bool,
}

/// Result a get step records under its plan ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// Step name.
    pub name: String,
    /// Cache holding the fetched version.
    pub resource_cache: ResourceCache,
}

/// Lifecycle callbacks shared by every step kind.
#[async_trait]
pub trait BuildStepDelegate: Send + Sync {
    /// Writer that turns stdout into log events.
    fn stdout(&self) -> EventWriter;
    /// Writer that turns stderr into log events.
    fn stderr(&self) -> EventWriter;
    /// The step is preparing to run.
    async fn initializing(&self);
    /// The step's process is starting.
    async fn starting(&self);
    /// The step completed.
    async fn finished(&self, succeeded: bool);
    /// The step errored.
    async fn errored(&self, message: &str);
    /// Resolves a step's container image by running check and get sub-plans.
    async fn fetch_image(
        &self,
        ctx: &CancellationToken,
        image: &ImageResource,
        resource_types: &[ResourceTypeConfig],
        privileged: bool,
    ) -> Result<ImageSpec>;
}

/// Callbacks for task steps.
#[async_trait]
pub trait TaskDelegate: BuildStepDelegate {
    /// Records the resolved config included in later events.
    fn set_task_config(&self, config: TaskConfig);
    /// The task is preparing to run.
    async fn task_initializing(&self);
    /// The task process is starting.
    async fn task_starting(&self);
    /// The task process exited.
    async fn task_finished(&self, exit_status: ExitStatus);
}

/// Callbacks for get steps.
#[async_trait]
pub trait GetDelegate: BuildStepDelegate {
    /// The get finished fetching a version.
    async fn get_finished(
        &self,
        exit_status: ExitStatus,
        version: &Version,
        metadata: &[MetadataField],
    );
}

/// Callbacks for put steps.
#[async_trait]
pub trait PutDelegate: BuildStepDelegate {
    /// The put finished creating a version.
    async fn put_finished(
        &self,
        exit_status: ExitStatus,
        version: &Version,
        metadata: &[MetadataField],
    );
    /// Records the created version on the build's resource.
    async fn save_output(&self, resource: &str, version: &Version, metadata: &[MetadataField]);
}

/// Callbacks for check steps, including the decision whether to run at all.
#[async_trait]
pub trait CheckDelegate: BuildStepDelegate {
    /// Finds the scope the check's versions belong to.
    async fn find_or_create_scope(
        &self,
        config: &dyn ResourceConfig,
    ) -> Result<Arc<dyn ResourceConfigScope>>;
    /// Decides whether the check runs. When it does, the returned lock must
    /// be released once the check is done.
    async fn wait_to_run(
        &self,
        ctx: &CancellationToken,
        scope: &dyn ResourceConfigScope,
    ) -> Result<(Box<dyn Lock>, bool)>;
    /// Points the owning resource or resource type at the checked scope.
    async fn point_to_checked_config(&self, scope: &dyn ResourceConfigScope) -> Result<()>;
    /// Records the check start. Returns whether it was recorded and the build ID used.
    async fn update_scope_last_check_start_time(
        &self,
        scope: &dyn ResourceConfigScope,
        nested: bool,
    ) -> Result<(bool, i64)>;
    /// Records the check end.
    async fn update_scope_last_check_end_time(
        &self,
        scope: &dyn ResourceConfigScope,
        succeeded: bool,
    ) -> Result<bool>;
}

/// Callbacks for set_pipeline steps.
#[async_trait]
pub trait SetPipelineStepDelegate: BuildStepDelegate {
    /// Reports whether the pipeline config changed.
    async fn set_pipeline_changed(&self, changed: bool);
    /// Validates the new pipeline config against policy.
    async fn check_run_set_pipeline_policy(&self, config: &serde_json::Value) -> Result<()>;
}

/// Creates build step delegates for a given run state.
pub trait BuildStepDelegateFactory: Send + Sync + Debug {
    /// Returns a delegate writing into the build of this factory.
    fn build_step_delegate(&self, state: &RunState) -> Box<dyn BuildStepDelegate>;
}
