//! Run states of the builds an engine is tracking.

use crate::exec::RunState;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Run states keyed by build ID.
///
/// A state is inserted the first time a build is resumed and removed once
/// its run finishes. Releasing a build leaves its state in place so a later
/// resume in this process picks up the same artifacts and results. Clones
/// share the same map.
#[derive(Clone, Default)]
pub struct TrackedStates {
    states: Arc<DashMap<i64, RunState>>,
}

impl TrackedStates {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `build_id`, creating it with `create` if the
    /// build is not tracked yet.
    pub fn get_or_insert_with(&self, build_id: i64, create: impl FnOnce() -> RunState) -> RunState {
        self.states.entry(build_id).or_insert_with(create).clone()
    }

    /// The state of `build_id`, if tracked.
    #[must_use]
    pub fn get(&self, build_id: i64) -> Option<RunState> {
        self.states.get(&build_id).map(|state| state.clone())
    }

    /// Stops tracking `build_id`.
    pub fn remove(&self, build_id: i64) -> Option<RunState> {
        self.states.remove(&build_id).map(|(_, state)| state)
    }

    /// Whether `build_id` is tracked.
    #[must_use]
    pub fn contains(&self, build_id: i64) -> bool {
        self.states.contains_key(&build_id)
    }

    /// Number of tracked builds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no build is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl fmt::Debug for TrackedStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedStates")
            .field("len", &self.len())
            .finish()
    }
}
