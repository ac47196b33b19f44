//! Compiling persisted plans into runnable step trees.
//!
//! Combinators are built here; leaves that need workers or storage are
//! handed to a [`CoreStepFactory`] together with their metadata and a
//! [`crate::delegates::DelegateFactory`].

mod core_factory;
mod step_builder;

pub use core_factory::CoreStepFactory;
pub use step_builder::{BuildStepper, StepBuilder, SUPPORTED_SCHEMA};
