//! Error types for build execution.
//!
//! Every configuration or integrity failure the engine can observe has a
//! named variant here. Cancellation is a variant of its own so that it can be
//! recognised through any amount of wrapping.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExecError>;

/// The main error type for build execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The step (or the whole build) was cancelled.
    #[error("interrupted: {0}")]
    Cancelled(String),

    /// A build was recorded with a schema no registered engine understands.
    #[error("{0}")]
    UnknownEngine(#[from] UnknownEngineError),

    /// The builder was asked to compile a build produced by another engine.
    #[error("schema not supported")]
    SchemaNotSupported,

    /// The pipeline owning a check or step no longer exists.
    #[error("pipeline not found")]
    PipelineNotFound,

    /// A resource was removed while a check was running.
    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    /// A resource type was removed while a check was running.
    #[error("resource type '{0}' not found")]
    ResourceTypeNotFound(String),

    /// A duration string could not be parsed.
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration {
        /// The offending input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The worker running a step went away.
    #[error("worker disappeared: {0}")]
    WorkerDisappeared(String),

    /// The build should be rerun from scratch.
    #[error("{0}")]
    Retriable(Box<ExecError>),

    /// A step panicked.
    #[error("step panicked: {0}")]
    Panicked(String),

    /// The policy agent could not be consulted.
    #[error("policy check: {0}")]
    PolicyCheck(String),

    /// The policy agent rejected the action.
    #[error("policy check failed: {}", .0.join(", "))]
    PolicyCheckFailed(Vec<String>),

    /// Running the image check sub-plan did not succeed.
    #[error("image check failed")]
    ImageCheckFailed,

    /// Running the image get sub-plan did not succeed.
    #[error("image fetching failed")]
    ImageGetFailed,

    /// The image check finished without producing a version.
    #[error("check did not return a version")]
    ImageVersionMissing,

    /// No artifact was registered under the given name.
    #[error("artifact '{0}' not found")]
    ArtifactNotFound(String),

    /// A variable referenced by a plan could not be resolved.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    /// Engine or logging configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An error annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// The underlying failure.
        #[source]
        source: Box<ExecError>,
    },

    /// Several sibling steps errored.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<ExecError>),

    /// A step implementation failed.
    #[error("{0}")]
    Step(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Opaque failure reported by an external step implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn join_errors(errors: &[ExecError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ExecError {
    /// Creates a step error from a message.
    #[must_use]
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }

    /// Creates a storage error from a message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Wraps the error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns true if this error, or any error it wraps, is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Context { source, .. } | Self::Retriable(source) => source.is_cancelled(),
            Self::Other(err) => wrapped(err).any(Self::is_cancelled),
            _ => false,
        }
    }

    /// Returns the reason given when the cancellation was requested.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&str> {
        match self {
            Self::Cancelled(reason) => Some(reason),
            Self::Context { source, .. } | Self::Retriable(source) => source.cancel_reason(),
            Self::Other(err) => wrapped(err).find_map(Self::cancel_reason),
            _ => None,
        }
    }

    /// Returns true if this error asks for the whole build to be rerun.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Retriable(_) => true,
            Self::Context { source, .. } => source.is_retriable(),
            Self::Other(err) => wrapped(err).any(Self::is_retriable),
            _ => false,
        }
    }

    /// Returns true if this error, or any error it wraps, reports a lost worker.
    #[must_use]
    pub fn is_worker_disappeared(&self) -> bool {
        match self {
            Self::WorkerDisappeared(_) => true,
            Self::Context { source, .. } => source.is_worker_disappeared(),
            Self::Other(err) => wrapped(err).any(Self::is_worker_disappeared),
            _ => false,
        }
    }
}

/// The crate errors found anywhere in an opaque error's chain.
fn wrapped(err: &anyhow::Error) -> impl Iterator<Item = &ExecError> {
    err.chain().filter_map(|cause| cause.downcast_ref::<ExecError>())
}

/// Error returned when a build's schema does not match any known engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown build engine schema: {schema:?}")]
pub struct UnknownEngineError {
    /// The schema recorded on the build.
    pub schema: String,
}

impl UnknownEngineError {
    /// Creates a new unknown engine error.
    #[must_use]
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }
}
