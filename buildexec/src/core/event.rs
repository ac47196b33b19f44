//! Durable build events.
//!
//! Everything a build does is recorded as a sequence of these events on the
//! build's log. Replaying the log reconstructs what happened, including the
//! reason for a non-successful outcome.

use crate::plan::{PlanId, TaskConfig, Version};
use serde::{Deserialize, Serialize};

/// The output stream a log event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Where an event came from: the plan node and, for logs, the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Origin {
    /// The plan node that produced the event.
    pub id: PlanId,
    /// The output stream, for log events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OriginSource>,
}

impl Origin {
    /// Creates an origin for a plan node.
    #[must_use]
    pub fn new(id: PlanId) -> Self {
        Self { id, source: None }
    }

    /// Sets the output stream.
    #[must_use]
    pub fn with_source(mut self, source: OriginSource) -> Self {
        self.source = Some(source);
        self
    }
}

/// A name/value pair reported by a resource alongside a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

/// A persisted build event. Every variant carries a Unix timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A chunk of stdout/stderr output.
    Log {
        /// Unix seconds.
        time: i64,
        /// Plan node and stream.
        origin: Origin,
        /// The (possibly redacted) output.
        payload: String,
    },
    /// A step-level error message.
    Error {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Error message.
        message: String,
    },
    /// A step is initializing.
    Initialize {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
    },
    /// A step started running.
    Start {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
    },
    /// A step finished.
    Finish {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Whether the step succeeded.
        succeeded: bool,
    },
    /// A task is initializing with the given (redacted) config.
    InitializeTask {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Redacted task config snapshot.
        config: TaskConfig,
    },
    /// A task process started.
    StartTask {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Redacted task config snapshot.
        config: TaskConfig,
    },
    /// A task process exited.
    FinishTask {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Process exit status.
        exit_status: i32,
    },
    /// A get step finished fetching a version.
    FinishGet {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Process exit status.
        exit_status: i32,
        /// The fetched version.
        version: Version,
        /// Metadata reported by the resource.
        metadata: Vec<MetadataField>,
    },
    /// A put step finished creating a version.
    FinishPut {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Process exit status.
        exit_status: i32,
        /// The created version.
        version: Version,
        /// Metadata reported by the resource.
        metadata: Vec<MetadataField>,
    },
    /// A set_pipeline step finished.
    SetPipelineChanged {
        /// Unix seconds.
        time: i64,
        /// Plan node.
        origin: Origin,
        /// Whether the pipeline config changed.
        changed: bool,
    },
    /// An image check sub-plan is about to run.
    ImageCheck {
        /// Unix seconds.
        time: i64,
        /// Plan node of the step fetching the image.
        origin: Origin,
        /// The synthesized plan.
        plan: serde_json::Value,
    },
    /// An image get sub-plan is about to run.
    ImageGet {
        /// Unix seconds.
        time: i64,
        /// Plan node of the step fetching the image.
        origin: Origin,
        /// The synthesized plan.
        plan: serde_json::Value,
    },
}

impl Event {
    /// Returns the event's Unix timestamp.
    #[must_use]
    pub const fn time(&self) -> i64 {
        match self {
            Self::Log { time, .. }
            | Self::Error { time, .. }
            | Self::Initialize { time, .. }
            | Self::Start { time, .. }
            | Self::Finish { time, .. }
            | Self::InitializeTask { time, .. }
            | Self::StartTask { time, .. }
            | Self::FinishTask { time, .. }
            | Self::FinishGet { time, .. }
            | Self::FinishPut { time, .. }
            | Self::SetPipelineChanged { time, .. }
            | Self::ImageCheck { time, .. }
            | Self::ImageGet { time, .. } => *time,
        }
    }

    /// Returns the event's origin.
    #[must_use]
    pub const fn origin(&self) -> &Origin {
        match self {
            Self::Log { origin, .. }
            | Self::Error { origin, .. }
            | Self::Initialize { origin, .. }
            | Self::Start { origin, .. }
            | Self::Finish { origin, .. }
            | Self::InitializeTask { origin, .. }
            | Self::StartTask { origin, .. }
            | Self::FinishTask { origin, .. }
            | Self::FinishGet { origin, .. }
            | Self::FinishPut { origin, .. }
            | Self::SetPipelineChanged { origin, .. }
            | Self::ImageCheck { origin, .. }
            | Self::ImageGet { origin, .. } => origin,
        }
    }

    /// Returns the event type name as persisted.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
            Self::Initialize { .. } => "initialize",
            Self::Start { .. } => "start",
            Self::Finish { .. } => "finish",
            Self::InitializeTask { .. } => "initialize_task",
            Self::StartTask { .. } => "start_task",
            Self::FinishTask { .. } => "finish_task",
            Self::FinishGet { .. } => "finish_get",
            Self::FinishPut { .. } => "finish_put",
            Self::SetPipelineChanged { .. } => "set_pipeline_changed",
            Self::ImageCheck { .. } => "image_check",
            Self::ImageGet { .. } => "image_get",
        }
    }
}
