//! Tracking builds to completion.
//!
//! An engine turns a persisted build into a [`Runnable`]. Resuming a
//! runnable is idempotent and safe to call from many processes at once: a
//! per-build tracking lock makes sure only one of them runs the build, and
//! everything it learns is written back to the build rather than returned.

mod db_engine;
mod exec_engine;
mod tracked;

pub use db_engine::{DbBuild, DbEngine};
pub use exec_engine::{ExecBuild, ExecEngine};
pub use tracked::TrackedStates;

use crate::db::Build;
use crate::errors::Result;
use crate::plan::Plan;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Lease of the per-build tracking lock.
pub const TRACKING_LOCK_LEASE: Duration = Duration::from_secs(60);

/// A build an engine can drive.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Runnable: Send + Sync {
    /// ID of the build.
    fn build_id(&self) -> i64;

    /// Runs the build if no other process is, until it finishes, is
    /// aborted, or the engine is released.
    async fn resume(&self);

    /// Requests that the build stop.
    async fn abort(&self) -> Result<()>;
}

/// Produces runnables for the builds of one plan schema.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Engine: Send + Sync {
    /// The schema recorded on builds this engine starts.
    fn schema(&self) -> String;

    /// Starts `build` with `plan`. A build that cannot be started, e.g.
    /// because it was aborted first, is aborted again so that it finishes.
    async fn create_build(&self, build: Arc<dyn Build>, plan: &Plan) -> Result<Box<dyn Runnable>>;

    /// Wraps an existing build.
    fn lookup_build(&self, build: Arc<dyn Build>) -> Result<Box<dyn Runnable>>;

    /// Stops waiting on every running build without cancelling it, and
    /// returns once all resumes have returned.
    async fn release_all(&self);
}
