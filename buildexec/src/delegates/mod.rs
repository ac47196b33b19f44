//! Delegates that record step progress on a build.
//!
//! [`DelegateFactory`] hands out one delegate per step kind. Each wraps a
//! [`BuildDelegate`], which saves lifecycle events, turns step output into
//! log events and resolves step images.

mod build_step;
mod check;
mod factory;
mod get_put;
mod image;
pub mod policy;
pub mod rate_limiter;
mod set_pipeline;
mod task;

pub use build_step::BuildDelegate;
pub use check::CheckStepDelegate;
pub use factory::DelegateFactory;
pub use get_put::{GetStepDelegate, PutStepDelegate};
pub use image::{ArtifactSourcer, VolumeSourcer};
pub use policy::{
    NoopPolicyChecker, PolicyChecker, PolicyInput, PolicyResult, ACTION_SET_PIPELINE,
    ACTION_USE_IMAGE,
};
pub use rate_limiter::{IntervalRateLimiter, NoopRateLimiter, RateLimiter};
pub use set_pipeline::SetPipelineDelegate;
pub use task::TaskStepDelegate;
