//! In-memory collaborators and scripted steps for exercising builds
//! without storage or workers.

mod assertions;
mod fixtures;
mod mocks;
mod resources;

pub use assertions::{
    assert_finished, assert_not_finished, error_messages, event_types, log_payloads,
};
pub use fixtures::{
    delegate_factory, run_state, test_now, FakeBuild, FakeLock, FakeNotifier,
};
pub use mocks::{
    BlockingStep, FactoryCall, FakeStep, FakeStepFactory, PanickingStep, VarProbe,
};
pub use resources::{FakePipeline, FakeResourceConfig, FakeResourceConfigScope};
