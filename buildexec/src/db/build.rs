//! The persisted build this core executes.

use super::{AbortNotifier, Lock, Pipeline, ResourceCache};
use crate::core::{BuildStatus, Event, MetadataField};
use crate::errors::{ExecError, Result};
use crate::exec::Variables;
use crate::plan::{Params, Plan, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Name given to builds that only run a resource check.
pub const CHECK_BUILD_NAME: &str = "check";

/// A build row owned by the persistence layer.
///
/// Identity accessors and `status`/`schema` read the last loaded row;
/// [`Build::reload`] refreshes it. Everything else talks to storage.
#[async_trait]
pub trait Build: Send + Sync + Debug {
    /// Build ID.
    fn id(&self) -> i64;
    /// Build name (a counter for job builds).
    fn name(&self) -> String;
    /// Team ID.
    fn team_id(&self) -> i64;
    /// Team name.
    fn team_name(&self) -> String;
    /// Pipeline ID, 0 for one-off builds.
    fn pipeline_id(&self) -> i64;
    /// Pipeline name, empty for one-off builds.
    fn pipeline_name(&self) -> String;
    /// Instance vars of the pipeline, if any.
    fn pipeline_instance_vars(&self) -> Option<Params>;
    /// Job ID, 0 for one-off builds.
    fn job_id(&self) -> i64;
    /// Job name, empty for one-off builds.
    fn job_name(&self) -> String;
    /// User who created the build.
    fn created_by(&self) -> Option<String>;

    /// Current status.
    fn status(&self) -> BuildStatus;
    /// Schema of the engine that started the build; empty until started.
    fn schema(&self) -> String;
    /// The plan the engine runs.
    fn private_plan(&self) -> Plan;
    /// The plan shown to users.
    fn public_plan(&self) -> Option<serde_json::Value>;
    /// Whether a user triggered the build by hand.
    fn is_manually_triggered(&self) -> bool;
    /// When the build row was created.
    fn create_time(&self) -> DateTime<Utc>;
    /// When the build started running.
    fn start_time(&self) -> Option<DateTime<Utc>>;
    /// When the build finished.
    fn end_time(&self) -> Option<DateTime<Utc>>;

    /// Returns true until the build reaches a terminal status.
    fn is_running(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Returns true for builds that only run a resource check.
    fn is_check(&self) -> bool {
        self.name() == CHECK_BUILD_NAME
    }

    /// Refreshes the row; `false` means it was deleted.
    async fn reload(&self) -> Result<bool>;
    /// Appends an event to the build log.
    async fn save_event(&self, event: Event) -> Result<()>;
    /// Transitions to a terminal status.
    async fn finish(&self, status: BuildStatus) -> Result<()>;
    /// Records the error and finishes as errored.
    async fn finish_with_error(&self, cause: &ExecError) -> Result<()>;
    /// Tries to take the tracking lock; `None` if another process holds it.
    async fn acquire_tracking_lock(&self, lease: Duration) -> Result<Option<Box<dyn Lock>>>;
    /// Subscribes to abort requests for this build.
    async fn abort_notifier(&self) -> Result<Box<dyn AbortNotifier>>;
    /// Flags the build as aborted in storage.
    async fn mark_as_aborted(&self) -> Result<()>;
    /// Records the engine schema and plan; `false` if the build was aborted first.
    async fn start(&self, schema: &str, plan: &Plan) -> Result<bool>;
    /// Credential variables available to the build.
    async fn variables(&self) -> Result<Arc<dyn Variables>>;
    /// The pipeline the build belongs to, if it still exists.
    async fn pipeline(&self) -> Result<Option<Arc<dyn Pipeline>>>;
    /// Hook called when a resource check build starts checking.
    async fn on_check_build_start(&self) -> Result<()>;
    /// Records the resource cache used as a step image.
    async fn save_image_resource_version(&self, cache: &ResourceCache) -> Result<()>;
    /// Records a version produced by a put step.
    async fn save_output(
        &self,
        resource: &str,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<()>;
}
