//! Assertions over the events a build recorded.

use super::fixtures::FakeBuild;
use crate::core::{BuildStatus, Event};

/// Event types in order, e.g. `["initialize", "start", "log"]`.
#[must_use]
pub fn event_types(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::event_type).collect()
}

/// Payloads of every log event, in order.
#[must_use]
pub fn log_payloads(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Log { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

/// Messages of every error event, in order.
#[must_use]
pub fn error_messages(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Asserts the build finished exactly once, with `expected`.
pub fn assert_finished(build: &FakeBuild, expected: BuildStatus) {
    assert_eq!(
        build.finishes(),
        vec![expected],
        "expected a single finish with {expected:?}"
    );
}

/// Asserts the build was never finished.
pub fn assert_not_finished(build: &FakeBuild) {
    assert!(
        build.finishes().is_empty(),
        "expected no finish, got {:?}",
        build.finishes()
    );
}
