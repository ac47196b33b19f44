//! In-memory pipelines, resources and check scopes.

use super::fixtures::FakeLock;
use crate::db::{
    LastCheck, Lock, Pipeline, Resource, ResourceConfig, ResourceConfigScope, ResourceType,
};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type ScopeCell = Arc<Mutex<Option<i64>>>;

/// A pipeline whose resources remember the scope they were pointed at.
#[derive(Clone, Default)]
pub struct FakePipeline {
    id: i64,
    name: String,
    resources: BTreeMap<String, (i64, ScopeCell)>,
    resource_types: BTreeMap<String, ScopeCell>,
}

impl FakePipeline {
    /// Creates a pipeline with no resources.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a resource.
    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, id: i64) -> Self {
        self.resources.insert(name.into(), (id, ScopeCell::default()));
        self
    }

    /// Adds a resource type.
    #[must_use]
    pub fn with_resource_type(mut self, name: impl Into<String>) -> Self {
        self.resource_types.insert(name.into(), ScopeCell::default());
        self
    }

    /// The scope the named resource points at.
    #[must_use]
    pub fn resource_scope(&self, name: &str) -> Option<i64> {
        self.resources.get(name).and_then(|(_, cell)| *cell.lock())
    }

    /// The scope the named resource type points at.
    #[must_use]
    pub fn resource_type_scope(&self, name: &str) -> Option<i64> {
        self.resource_types.get(name).and_then(|cell| *cell.lock())
    }
}

impl fmt::Debug for FakePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakePipeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Pipeline for FakePipeline {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn resource(&self, name: &str) -> Result<Option<Arc<dyn Resource>>> {
        Ok(self.resources.get(name).map(|(id, cell)| {
            Arc::new(FakeResource {
                id: *id,
                name: name.to_string(),
                scope: Arc::clone(cell),
            }) as Arc<dyn Resource>
        }))
    }

    async fn resource_type(&self, name: &str) -> Result<Option<Arc<dyn ResourceType>>> {
        Ok(self.resource_types.get(name).map(|cell| {
            Arc::new(FakeResourceType {
                name: name.to_string(),
                scope: Arc::clone(cell),
            }) as Arc<dyn ResourceType>
        }))
    }
}

struct FakeResource {
    id: i64,
    name: String,
    scope: ScopeCell,
}

#[async_trait]
impl Resource for FakeResource {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    async fn set_resource_config_scope(&self, scope: &dyn ResourceConfigScope) -> Result<()> {
        *self.scope.lock() = Some(scope.id());
        Ok(())
    }
}

struct FakeResourceType {
    name: String,
    scope: ScopeCell,
}

#[async_trait]
impl ResourceType for FakeResourceType {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn set_resource_config_scope(&self, scope: &dyn ResourceConfigScope) -> Result<()> {
        *self.scope.lock() = Some(scope.id());
        Ok(())
    }
}

/// A resource config handing out one scope per resource.
#[derive(Debug, Clone, Copy)]
pub struct FakeResourceConfig {
    id: i64,
}

impl FakeResourceConfig {
    /// Creates a config.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

#[async_trait]
impl ResourceConfig for FakeResourceConfig {
    fn id(&self) -> i64 {
        self.id
    }

    async fn find_or_create_scope(
        &self,
        resource_id: Option<i64>,
    ) -> Result<Arc<dyn ResourceConfigScope>> {
        let mut scope = FakeResourceConfigScope::new(self.id * 100 + resource_id.unwrap_or(0));
        scope.resource_id = resource_id;
        Ok(Arc::new(scope))
    }
}

type LockHook = Box<dyn Fn() + Send + Sync>;

struct ScopeState {
    last_check: Mutex<LastCheck>,
    last_check_calls: AtomicUsize,
    busy_attempts: AtomicUsize,
    lock_attempts: AtomicUsize,
    on_lock_attempt: Mutex<Option<LockHook>>,
    locked: Arc<AtomicBool>,
    check_starts: Mutex<Vec<(i64, Option<serde_json::Value>)>>,
    check_ends: Mutex<Vec<bool>>,
}

/// A check scope with an in-memory last check and checking lock.
///
/// Clones share state.
#[derive(Clone)]
pub struct FakeResourceConfigScope {
    id: i64,
    resource_id: Option<i64>,
    state: Arc<ScopeState>,
}

impl FakeResourceConfigScope {
    /// Creates a global scope that has never been checked.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            resource_id: None,
            state: Arc::new(ScopeState {
                last_check: Mutex::new(LastCheck {
                    start_time: DateTime::UNIX_EPOCH,
                    end_time: DateTime::UNIX_EPOCH,
                    succeeded: false,
                }),
                last_check_calls: AtomicUsize::new(0),
                busy_attempts: AtomicUsize::new(0),
                lock_attempts: AtomicUsize::new(0),
                on_lock_attempt: Mutex::new(None),
                locked: Arc::new(AtomicBool::new(false)),
                check_starts: Mutex::new(Vec::new()),
                check_ends: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Sets the most recent check.
    #[must_use]
    pub fn with_last_check(self, last_check: LastCheck) -> Self {
        self.set_last_check(last_check);
        self
    }

    /// Refuses the first `attempts` lock attempts, as if another checker
    /// held the lock.
    #[must_use]
    pub fn with_lock_held_for(self, attempts: usize) -> Self {
        self.state.busy_attempts.store(attempts, Ordering::SeqCst);
        self
    }

    /// Replaces the most recent check.
    pub fn set_last_check(&self, last_check: LastCheck) {
        *self.state.last_check.lock() = last_check;
    }

    /// Runs `hook` on every lock attempt, before the attempt resolves.
    pub fn on_lock_attempt(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.state.on_lock_attempt.lock() = Some(Box::new(hook));
    }

    /// How many times the checking lock was requested.
    #[must_use]
    pub fn lock_attempts(&self) -> usize {
        self.state.lock_attempts.load(Ordering::SeqCst)
    }

    /// Whether the checking lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.locked.load(Ordering::SeqCst)
    }

    /// How many times the last check was read.
    #[must_use]
    pub fn last_check_calls(&self) -> usize {
        self.state.last_check_calls.load(Ordering::SeqCst)
    }

    /// Recorded check starts as `(build_id, public_plan)`.
    #[must_use]
    pub fn check_starts(&self) -> Vec<(i64, Option<serde_json::Value>)> {
        self.state.check_starts.lock().clone()
    }

    /// Recorded check outcomes.
    #[must_use]
    pub fn check_ends(&self) -> Vec<bool> {
        self.state.check_ends.lock().clone()
    }
}

impl fmt::Debug for FakeResourceConfigScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeResourceConfigScope")
            .field("id", &self.id)
            .field("resource_id", &self.resource_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceConfigScope for FakeResourceConfigScope {
    fn id(&self) -> i64 {
        self.id
    }

    fn resource_id(&self) -> Option<i64> {
        self.resource_id
    }

    async fn last_check(&self) -> Result<LastCheck> {
        self.state.last_check_calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.state.last_check.lock())
    }

    async fn acquire_resource_checking_lock(&self) -> Result<Option<Box<dyn Lock>>> {
        self.state.lock_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.state.on_lock_attempt.lock().as_ref() {
            hook();
        }

        let busy = self
            .state
            .busy_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Ok(None);
        }

        let acquired = self
            .state
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        Ok(acquired.then(|| {
            Box::new(FakeLock::sharing(Arc::clone(&self.state.locked))) as Box<dyn Lock>
        }))
    }

    async fn update_last_check_start_time(
        &self,
        build_id: i64,
        public_plan: Option<serde_json::Value>,
    ) -> Result<bool> {
        self.state.check_starts.lock().push((build_id, public_plan));
        Ok(true)
    }

    async fn update_last_check_end_time(&self, succeeded: bool) -> Result<bool> {
        self.state.check_ends.lock().push(succeeded);
        Ok(true)
    }
}
