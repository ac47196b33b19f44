//! The seam between plan compilation and the steps that touch workers.

use crate::db::Build;
use crate::delegates::DelegateFactory;
use crate::exec::{BoxStep, ContainerMetadata, StepMetadata};
use crate::plan::Plan;
use std::sync::Arc;

/// Creates the leaf steps of a build.
///
/// Implementations talk to workers, resources and the artifact store; the
/// builder only decides which method to call and with what metadata. Each
/// method receives the whole plan node so the step can read its own payload
/// and ID.
pub trait CoreStepFactory: Send + Sync {
    /// Fetches a resource version.
    fn get_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Pushes to a resource.
    fn put_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Runs a task.
    fn task_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Sends a message to a prototype.
    fn run_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Checks a resource.
    fn check_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        container: ContainerMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Configures a pipeline.
    fn set_pipeline_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Loads a file into a local var.
    fn load_var_step(
        &self,
        plan: &Plan,
        metadata: StepMetadata,
        delegates: DelegateFactory,
    ) -> BoxStep;

    /// Imports an uploaded artifact.
    fn artifact_input_step(&self, plan: &Plan, build: Arc<dyn Build>) -> BoxStep;

    /// Exports an artifact.
    fn artifact_output_step(&self, plan: &Plan, build: Arc<dyn Build>) -> BoxStep;
}
