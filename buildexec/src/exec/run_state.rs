//! Per-build mutable execution state.

use super::artifacts::ArtifactRepository;
use super::vars::{interpolate, CredentialTracker, LocalVars, VarRef, Variables};
use super::Stepper;
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::plan::{Plan, PlanId};
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct Shared {
    stepper: Arc<dyn Stepper>,
    credentials: Arc<dyn Variables>,
    tracker: CredentialTracker,
    results: RwLock<HashMap<PlanId, Arc<dyn Any + Send + Sync>>>,
}

/// State threaded through every step of one build run.
///
/// Cloning is cheap and yields a handle to the same state. Scopes created
/// with [`RunState::new_local_scope`] get their own artifacts and local vars
/// but share results and credentials with the rest of the build.
#[derive(Clone)]
pub struct RunState {
    shared: Arc<Shared>,
    artifacts: Arc<ArtifactRepository>,
    locals: Arc<LocalVars>,
}

impl RunState {
    /// Creates the root state for a build.
    #[must_use]
    pub fn new(
        stepper: Arc<dyn Stepper>,
        credentials: Arc<dyn Variables>,
        enable_redaction: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                stepper,
                credentials,
                tracker: CredentialTracker::new(enable_redaction),
                results: RwLock::new(HashMap::new()),
            }),
            artifacts: Arc::new(ArtifactRepository::new()),
            locals: Arc::new(LocalVars::default()),
        }
    }

    /// The artifacts visible from this scope.
    #[must_use]
    pub fn artifact_repository(&self) -> &Arc<ArtifactRepository> {
        &self.artifacts
    }

    /// Creates a child scope.
    #[must_use]
    pub fn new_local_scope(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            artifacts: self.artifacts.new_scope(),
            locals: self.locals.new_scope(),
        }
    }

    /// Returns the result recorded for a plan, if any.
    #[must_use]
    pub fn result<T: Clone + 'static>(&self, id: &PlanId) -> Option<T> {
        self.shared
            .results
            .read()
            .get(id)
            .and_then(|r| r.downcast_ref::<T>())
            .cloned()
    }

    /// Records a plan's result. The first result stored for an ID wins.
    pub fn store_result<T: Send + Sync + 'static>(&self, id: PlanId, value: T) {
        self.shared
            .results
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(value));
    }

    /// Binds a local var in this scope, optionally treating it as a credential.
    pub fn add_local_var(&self, name: &str, value: Value, redact: bool) {
        if redact {
            self.shared.tracker.track(name, &value);
        }
        self.locals.set(name, value);
    }

    /// Returns a local var visible from this scope.
    #[must_use]
    pub fn local_var(&self, name: &str) -> Option<Value> {
        self.locals.get(name)
    }

    /// Resolves a reference, tracking credential values for redaction.
    pub fn get(&self, reference: &VarRef) -> Result<Value> {
        let value = if reference.is_local() {
            self.locals.get(&reference.name)
        } else {
            let value = self.shared.credentials.get(&reference.name);
            if let Some(v) = &value {
                self.shared.tracker.track(&reference.name, v);
            }
            value
        };

        value
            .and_then(|v| reference.select(v))
            .ok_or_else(|| ExecError::UndefinedVariable(reference.to_string()))
    }

    /// Replaces every `((var))` placeholder in `value`.
    pub fn interpolate(&self, value: &Value) -> Result<Value> {
        interpolate(value, &mut |reference| self.get(reference))
    }

    /// Whether step output must be scrubbed of credentials.
    #[must_use]
    pub fn redaction_enabled(&self) -> bool {
        self.shared.tracker.enabled()
    }

    /// The credential tracker for this build.
    #[must_use]
    pub fn credential_tracker(&self) -> &CredentialTracker {
        &self.shared.tracker
    }

    /// Scrubs tracked credentials from `text`.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.shared.tracker.redact(text)
    }

    /// Compiles `plan` with this build's stepper and runs it in this state.
    pub async fn run_plan(&self, ctx: &CancellationToken, plan: &Plan) -> Result<bool> {
        let step = self.shared.stepper.step_for(plan);
        step.run(ctx, self).await
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("artifacts", &self.artifacts.as_map().keys().collect::<Vec<_>>())
            .field("results", &self.shared.results.read().len())
            .field("redaction_enabled", &self.redaction_enabled())
            .finish()
    }
}
