//! Step execution: the [`Step`] trait, per-build [`RunState`] and the
//! combinators plans are compiled into.

mod across;
mod artifacts;
mod delegate;
mod hooks;
mod in_parallel;
mod log_error;
mod metadata;
mod retry;
mod run_state;
mod step;
mod timeout;
mod try_step;
mod vars;

pub use across::{AcrossStep, ScopedStep};
pub(crate) use across::panic_message;
pub use artifacts::{Artifact, ArtifactHandle, ArtifactRepository, VolumeArtifact};
pub use delegate::{
    BuildStepDelegate, BuildStepDelegateFactory, CheckDelegate, ExitStatus, GetDelegate,
    GetResult, ImageSpec, PutDelegate, SetPipelineStepDelegate, TaskDelegate,
};
pub use hooks::{EnsureStep, OnAbortStep, OnErrorStep, OnFailureStep, OnSuccessStep};
pub use in_parallel::InParallelStep;
pub use log_error::{LogErrorStep, RetryErrorStep, ABORTED_LOG_MESSAGE, TIMEOUT_LOG_MESSAGE};
pub use metadata::{working_directory, ContainerMetadata, ContainerType, StepMetadata};
pub use retry::RetryStep;
pub use run_state::RunState;
pub use step::{BoxStep, IdentityStep, Step, Stepper};
pub use timeout::{TimeoutStep, TIMEOUT_REASON};
pub use try_step::TryStep;
pub use vars::{CredentialTracker, StaticVariables, VarRef, Variables, REDACTED};
