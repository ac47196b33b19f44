//! Delegates for get and put steps.

use super::build_step::{forward_build_step_delegate, BuildDelegate};
use crate::core::{Event, MetadataField};
use crate::exec::{ExitStatus, GetDelegate, PutDelegate};
use crate::plan::Version;
use async_trait::async_trait;
use tracing::{error, info};

/// Reports a fetched version.
#[derive(Debug)]
pub struct GetStepDelegate {
    inner: BuildDelegate,
}

impl GetStepDelegate {
    /// Wraps a build delegate.
    #[must_use]
    pub fn new(inner: BuildDelegate) -> Self {
        Self { inner }
    }
}

forward_build_step_delegate!(GetStepDelegate, inner);

#[async_trait]
impl GetDelegate for GetStepDelegate {
    async fn get_finished(
        &self,
        exit_status: ExitStatus,
        version: &Version,
        metadata: &[MetadataField],
    ) {
        self.inner
            .save(Event::FinishGet {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                exit_status,
                version: version.clone(),
                metadata: metadata.to_vec(),
            })
            .await;
        info!(plan_id = %self.inner.plan_id, exit_status, "finished");
    }
}

/// Reports a created version and records it on the build.
#[derive(Debug)]
pub struct PutStepDelegate {
    inner: BuildDelegate,
}

impl PutStepDelegate {
    /// Wraps a build delegate.
    #[must_use]
    pub fn new(inner: BuildDelegate) -> Self {
        Self { inner }
    }
}

forward_build_step_delegate!(PutStepDelegate, inner);

#[async_trait]
impl PutDelegate for PutStepDelegate {
    async fn put_finished(
        &self,
        exit_status: ExitStatus,
        version: &Version,
        metadata: &[MetadataField],
    ) {
        self.inner
            .save(Event::FinishPut {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                exit_status,
                version: version.clone(),
                metadata: metadata.to_vec(),
            })
            .await;
        info!(plan_id = %self.inner.plan_id, exit_status, "finished");
    }

    async fn save_output(&self, resource: &str, version: &Version, metadata: &[MetadataField]) {
        if let Err(err) = self.inner.build.save_output(resource, version, metadata).await {
            error!(
                build_id = self.inner.build.id(),
                resource,
                error = %err,
                "failed-to-save-output"
            );
        }
    }
}
