//! # Buildexec
//!
//! The build-execution core of a CI/CD orchestrator.
//!
//! A build's persisted [`plan::Plan`] is compiled by a
//! [`builder::StepBuilder`] into a tree of [`exec::Step`]s. Leaves are
//! produced by a pluggable [`builder::CoreStepFactory`] and report their
//! lifecycle through [`delegates`]; combinators give the tree its
//! control flow:
//!
//! - **Sequencing**: `Do` chains, success/failure/abort/error hooks, `Ensure`
//! - **Concurrency**: `InParallel` and `Across` with bounded fan-out
//! - **Recovery**: `Retry`, `Try`, `Timeout`, reruns on worker loss
//!
//! The [`engine`] module drives compiled builds to a terminal status under
//! a per-build tracking lock, so any number of processes can resume the
//! same builds safely.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use buildexec::prelude::*;
//!
//! let builder = StepBuilder::new(factory, EngineConfig::default());
//! let engine = DbEngine::new(vec![Arc::new(ExecEngine::new(builder))]);
//!
//! let runnable = engine.create_build(build, &plan).await?;
//! runnable.resume().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod builder;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod db;
pub mod delegates;
pub mod engine;
pub mod errors;
pub mod events;
pub mod exec;
pub mod observability;
pub mod plan;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::{CoreStepFactory, StepBuilder, SUPPORTED_SCHEMA};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, LogConfig};
    pub use crate::core::{BuildStatus, Event, Origin};
    pub use crate::db::{AbortNotifier, Build, Lock};
    pub use crate::delegates::DelegateFactory;
    pub use crate::engine::{DbEngine, Engine, ExecEngine, Runnable};
    pub use crate::errors::{ExecError, Result, UnknownEngineError};
    pub use crate::events::EventWriter;
    pub use crate::exec::{RunState, Step, Stepper};
    pub use crate::observability::{init_tracing, MetricEvent, MetricsEmitter};
    pub use crate::plan::{Plan, PlanId, PlanStep};
    pub use crate::utils::{Clock, SystemClock};
}
