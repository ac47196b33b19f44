//! An in-memory build and the state helpers tests run against.

use super::resources::FakePipeline;
use crate::core::{BuildStatus, Event, MetadataField};
use crate::db::{AbortNotifier, Build, Lock, Pipeline, ResourceCache};
use crate::delegates::DelegateFactory;
use crate::errors::{ExecError, Result};
use crate::exec::{BoxStep, IdentityStep, RunState, StaticVariables, Stepper, Variables};
use crate::plan::{Params, Plan, Version};
use crate::utils::FakeClock;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// The fixed "now" fakes default to: 1991-06-03 05:30 UTC.
#[must_use]
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0)
        .single()
        .unwrap_or_default()
}

/// A root run state with no credentials whose stepper compiles every plan
/// to a no-op.
#[must_use]
pub fn run_state() -> RunState {
    RunState::new(Arc::new(NoopStepper), Arc::new(StaticVariables::new()), true)
}

/// A delegate factory for `plan_id` of `build` on a clock frozen at
/// [`test_now`].
#[must_use]
pub fn delegate_factory(build: &FakeBuild, plan_id: &str) -> DelegateFactory {
    DelegateFactory::new(Arc::new(build.clone()), plan_id)
        .with_clock(Arc::new(FakeClock::new(test_now())))
}

struct NoopStepper;

impl Stepper for NoopStepper {
    fn step_for(&self, _plan: &Plan) -> BoxStep {
        Box::new(IdentityStep)
    }
}

#[derive(Debug, Clone)]
struct Row {
    name: String,
    team_id: i64,
    team_name: String,
    pipeline_id: i64,
    pipeline_name: String,
    instance_vars: Option<Params>,
    job_id: i64,
    job_name: String,
    created_by: Option<String>,
    status: BuildStatus,
    schema: String,
    plan: Plan,
    manually_triggered: bool,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

/// Abort flag shared by a build and its notifiers.
#[derive(Debug, Default)]
struct AbortSignal {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    fn fire(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Recorded {
    events: Vec<Event>,
    finishes: Vec<BuildStatus>,
    finish_errors: Vec<String>,
    starts: Vec<(String, Plan)>,
    lock_leases: Vec<Duration>,
    outputs: Vec<(String, Version)>,
    image_versions: Vec<ResourceCache>,
}

struct Inner {
    id: i64,
    row: RwLock<Row>,
    recorded: Mutex<Recorded>,
    save_event_error: Mutex<Option<String>>,
    reload_error: Mutex<Option<String>>,
    found: AtomicBool,
    reloads: AtomicUsize,
    check_build_starts: AtomicUsize,
    tracking_lock_held: Arc<AtomicBool>,
    lock_releases: Arc<AtomicUsize>,
    marked_aborted: AtomicBool,
    abort: Arc<AbortSignal>,
    notifiers_closed: Arc<AtomicUsize>,
    variables: RwLock<StaticVariables>,
    pipeline: RwLock<Option<FakePipeline>>,
    public_plan: RwLock<Option<serde_json::Value>>,
}

/// An in-memory [`Build`] recording everything done to it.
///
/// Clones share state, so a test keeps one handle while the code under test
/// owns another. `with_*` methods configure the row before the test starts;
/// the remaining setters change it while the test runs.
#[derive(Clone)]
pub struct FakeBuild {
    inner: Arc<Inner>,
}

impl FakeBuild {
    /// Creates a pending one-off build.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                row: RwLock::new(Row {
                    name: id.to_string(),
                    team_id: 1,
                    team_name: "some-team".to_string(),
                    pipeline_id: 0,
                    pipeline_name: String::new(),
                    instance_vars: None,
                    job_id: 0,
                    job_name: String::new(),
                    created_by: None,
                    status: BuildStatus::Pending,
                    schema: String::new(),
                    plan: Plan::empty("root"),
                    manually_triggered: false,
                    create_time: test_now(),
                    start_time: None,
                    end_time: None,
                }),
                recorded: Mutex::new(Recorded::default()),
                save_event_error: Mutex::new(None),
                reload_error: Mutex::new(None),
                found: AtomicBool::new(true),
                reloads: AtomicUsize::new(0),
                check_build_starts: AtomicUsize::new(0),
                tracking_lock_held: Arc::new(AtomicBool::new(false)),
                lock_releases: Arc::new(AtomicUsize::new(0)),
                marked_aborted: AtomicBool::new(false),
                abort: Arc::new(AbortSignal::default()),
                notifiers_closed: Arc::new(AtomicUsize::new(0)),
                variables: RwLock::new(StaticVariables::new()),
                pipeline: RwLock::new(None),
                public_plan: RwLock::new(None),
            }),
        }
    }

    /// Sets the build name.
    #[must_use]
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.inner.row.write().name = name.into();
        self
    }

    /// Makes this a job build of `pipeline`.
    #[must_use]
    pub fn with_job(self, pipeline_id: i64, pipeline_name: &str, job_id: i64, job_name: &str) -> Self {
        {
            let mut row = self.inner.row.write();
            row.pipeline_id = pipeline_id;
            row.pipeline_name = pipeline_name.to_string();
            row.job_id = job_id;
            row.job_name = job_name.to_string();
        }
        self
    }

    /// Sets the team.
    #[must_use]
    pub fn with_team(self, team_id: i64, team_name: &str) -> Self {
        {
            let mut row = self.inner.row.write();
            row.team_id = team_id;
            row.team_name = team_name.to_string();
        }
        self
    }

    /// Sets the pipeline instance vars.
    #[must_use]
    pub fn with_instance_vars(self, vars: Params) -> Self {
        self.inner.row.write().instance_vars = Some(vars);
        self
    }

    /// Sets the creator.
    #[must_use]
    pub fn with_created_by(self, user: impl Into<String>) -> Self {
        self.inner.row.write().created_by = Some(user.into());
        self
    }

    /// Sets the schema, as if an engine had already started the build.
    #[must_use]
    pub fn with_schema(self, schema: impl Into<String>) -> Self {
        self.set_schema(schema);
        self
    }

    /// Sets the private plan.
    #[must_use]
    pub fn with_plan(self, plan: Plan) -> Self {
        self.inner.row.write().plan = plan;
        self
    }

    /// Sets the public plan.
    #[must_use]
    pub fn with_public_plan(self, plan: serde_json::Value) -> Self {
        *self.inner.public_plan.write() = Some(plan);
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(self, status: BuildStatus) -> Self {
        self.inner.row.write().status = status;
        self
    }

    /// Marks the build as triggered by a user.
    #[must_use]
    pub fn with_manually_triggered(self, manual: bool) -> Self {
        self.inner.row.write().manually_triggered = manual;
        self
    }

    /// Sets the creation time.
    #[must_use]
    pub fn with_create_time(self, time: DateTime<Utc>) -> Self {
        self.inner.row.write().create_time = time;
        self
    }

    /// Sets the start time.
    #[must_use]
    pub fn with_start_time(self, time: DateTime<Utc>) -> Self {
        self.inner.row.write().start_time = Some(time);
        self
    }

    /// Sets the pipeline returned by [`Build::pipeline`].
    #[must_use]
    pub fn with_pipeline(self, pipeline: FakePipeline) -> Self {
        *self.inner.pipeline.write() = Some(pipeline);
        self
    }

    /// Sets the credential variables.
    #[must_use]
    pub fn with_variables(self, variables: StaticVariables) -> Self {
        *self.inner.variables.write() = variables;
        self
    }

    /// Changes the schema.
    pub fn set_schema(&self, schema: impl Into<String>) {
        self.inner.row.write().schema = schema.into();
    }

    /// Makes the next reloads report the build as deleted.
    pub fn delete(&self) {
        self.inner.found.store(false, Ordering::SeqCst);
    }

    /// Makes every `save_event` fail with `message`.
    pub fn fail_save_event(&self, message: impl Into<String>) {
        *self.inner.save_event_error.lock() = Some(message.into());
    }

    /// Makes every `reload` fail with `message`.
    pub fn fail_reload(&self, message: impl Into<String>) {
        *self.inner.reload_error.lock() = Some(message.into());
    }

    /// Takes the tracking lock as if another process held it.
    pub fn hold_tracking_lock(&self) {
        self.inner.tracking_lock_held.store(true, Ordering::SeqCst);
    }

    /// Requests an abort, waking every notifier.
    pub fn abort(&self) {
        self.inner.abort.fire();
    }

    /// Saved events, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.recorded.lock().events.clone()
    }

    /// Statuses passed to `finish` and `finish_with_error`, in order.
    #[must_use]
    pub fn finishes(&self) -> Vec<BuildStatus> {
        self.inner.recorded.lock().finishes.clone()
    }

    /// Messages of errors passed to `finish_with_error`.
    #[must_use]
    pub fn finish_errors(&self) -> Vec<String> {
        self.inner.recorded.lock().finish_errors.clone()
    }

    /// `(schema, plan)` pairs passed to `start`.
    #[must_use]
    pub fn starts(&self) -> Vec<(String, Plan)> {
        self.inner.recorded.lock().starts.clone()
    }

    /// Leases requested for the tracking lock, including refused attempts.
    #[must_use]
    pub fn lock_leases(&self) -> Vec<Duration> {
        self.inner.recorded.lock().lock_leases.clone()
    }

    /// Whether the tracking lock is currently held.
    #[must_use]
    pub fn is_tracking_locked(&self) -> bool {
        self.inner.tracking_lock_held.load(Ordering::SeqCst)
    }

    /// How many times the tracking lock was released.
    #[must_use]
    pub fn lock_releases(&self) -> usize {
        self.inner.lock_releases.load(Ordering::SeqCst)
    }

    /// How many times the build was reloaded.
    #[must_use]
    pub fn reloads(&self) -> usize {
        self.inner.reloads.load(Ordering::SeqCst)
    }

    /// Whether `mark_as_aborted` was called.
    #[must_use]
    pub fn is_marked_aborted(&self) -> bool {
        self.inner.marked_aborted.load(Ordering::SeqCst)
    }

    /// How many abort notifiers were closed.
    #[must_use]
    pub fn notifiers_closed(&self) -> usize {
        self.inner.notifiers_closed.load(Ordering::SeqCst)
    }

    /// Outputs recorded by put steps.
    #[must_use]
    pub fn outputs(&self) -> Vec<(String, Version)> {
        self.inner.recorded.lock().outputs.clone()
    }

    /// Resource caches recorded as step images.
    #[must_use]
    pub fn image_resource_versions(&self) -> Vec<ResourceCache> {
        self.inner.recorded.lock().image_versions.clone()
    }

    /// How many times a check build started checking.
    #[must_use]
    pub fn check_build_starts(&self) -> usize {
        self.inner.check_build_starts.load(Ordering::SeqCst)
    }

    fn record_finish(&self, status: BuildStatus) {
        self.inner.recorded.lock().finishes.push(status);
        let mut row = self.inner.row.write();
        row.status = status;
        row.end_time = Some(test_now());
    }
}

impl fmt::Debug for FakeBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeBuild")
            .field("id", &self.inner.id)
            .field("status", &self.inner.row.read().status)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Build for FakeBuild {
    fn id(&self) -> i64 {
        self.inner.id
    }

    fn name(&self) -> String {
        self.inner.row.read().name.clone()
    }

    fn team_id(&self) -> i64 {
        self.inner.row.read().team_id
    }

    fn team_name(&self) -> String {
        self.inner.row.read().team_name.clone()
    }

    fn pipeline_id(&self) -> i64 {
        self.inner.row.read().pipeline_id
    }

    fn pipeline_name(&self) -> String {
        self.inner.row.read().pipeline_name.clone()
    }

    fn pipeline_instance_vars(&self) -> Option<Params> {
        self.inner.row.read().instance_vars.clone()
    }

    fn job_id(&self) -> i64 {
        self.inner.row.read().job_id
    }

    fn job_name(&self) -> String {
        self.inner.row.read().job_name.clone()
    }

    fn created_by(&self) -> Option<String> {
        self.inner.row.read().created_by.clone()
    }

    fn status(&self) -> BuildStatus {
        self.inner.row.read().status
    }

    fn schema(&self) -> String {
        self.inner.row.read().schema.clone()
    }

    fn private_plan(&self) -> Plan {
        self.inner.row.read().plan.clone()
    }

    fn public_plan(&self) -> Option<serde_json::Value> {
        self.inner.public_plan.read().clone()
    }

    fn is_manually_triggered(&self) -> bool {
        self.inner.row.read().manually_triggered
    }

    fn create_time(&self) -> DateTime<Utc> {
        self.inner.row.read().create_time
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.row.read().start_time
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.row.read().end_time
    }

    async fn reload(&self) -> Result<bool> {
        self.inner.reloads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.inner.reload_error.lock().clone() {
            return Err(ExecError::storage(message));
        }
        Ok(self.inner.found.load(Ordering::SeqCst))
    }

    async fn save_event(&self, event: Event) -> Result<()> {
        if let Some(message) = self.inner.save_event_error.lock().clone() {
            return Err(ExecError::storage(message));
        }
        self.inner.recorded.lock().events.push(event);
        Ok(())
    }

    async fn finish(&self, status: BuildStatus) -> Result<()> {
        self.record_finish(status);
        Ok(())
    }

    async fn finish_with_error(&self, cause: &ExecError) -> Result<()> {
        self.inner
            .recorded
            .lock()
            .finish_errors
            .push(cause.to_string());
        self.record_finish(BuildStatus::Errored);
        Ok(())
    }

    async fn acquire_tracking_lock(&self, lease: Duration) -> Result<Option<Box<dyn Lock>>> {
        self.inner.recorded.lock().lock_leases.push(lease);

        let acquired = self
            .inner
            .tracking_lock_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(FakeLock {
            held: Arc::clone(&self.inner.tracking_lock_held),
            releases: Arc::clone(&self.inner.lock_releases),
        })))
    }

    async fn abort_notifier(&self) -> Result<Box<dyn AbortNotifier>> {
        Ok(Box::new(FakeNotifier {
            signal: Arc::clone(&self.inner.abort),
            closed: Arc::clone(&self.inner.notifiers_closed),
        }))
    }

    async fn mark_as_aborted(&self) -> Result<()> {
        self.inner.marked_aborted.store(true, Ordering::SeqCst);
        self.inner.abort.fire();
        Ok(())
    }

    async fn start(&self, schema: &str, plan: &Plan) -> Result<bool> {
        if self.inner.abort.is_set() {
            return Ok(false);
        }

        self.inner
            .recorded
            .lock()
            .starts
            .push((schema.to_string(), plan.clone()));

        let mut row = self.inner.row.write();
        row.schema = schema.to_string();
        row.plan = plan.clone();
        row.status = BuildStatus::Started;
        row.start_time = Some(test_now());
        Ok(true)
    }

    async fn variables(&self) -> Result<Arc<dyn Variables>> {
        Ok(Arc::new(self.inner.variables.read().clone()))
    }

    async fn pipeline(&self) -> Result<Option<Arc<dyn Pipeline>>> {
        Ok(self
            .inner
            .pipeline
            .read()
            .clone()
            .map(|p| Arc::new(p) as Arc<dyn Pipeline>))
    }

    async fn on_check_build_start(&self) -> Result<()> {
        self.inner.check_build_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_image_resource_version(&self, cache: &ResourceCache) -> Result<()> {
        self.inner.recorded.lock().image_versions.push(cache.clone());
        Ok(())
    }

    async fn save_output(
        &self,
        resource: &str,
        version: &Version,
        _metadata: &[MetadataField],
    ) -> Result<()> {
        self.inner
            .recorded
            .lock()
            .outputs
            .push((resource.to_string(), version.clone()));
        Ok(())
    }
}

/// A lock that clears a shared flag when released.
#[derive(Debug, Clone, Default)]
pub struct FakeLock {
    held: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl FakeLock {
    /// Creates a held lock.
    #[must_use]
    pub fn new() -> Self {
        let lock = Self::default();
        lock.held.store(true, Ordering::SeqCst);
        lock
    }

    pub(crate) fn sharing(held: Arc<AtomicBool>) -> Self {
        Self {
            held,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether the lock is still held.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// How many times the lock was released.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lock for FakeLock {
    async fn release(&self) -> Result<()> {
        self.held.store(false, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An abort notifier driven by [`FakeBuild::abort`].
#[derive(Debug)]
pub struct FakeNotifier {
    signal: Arc<AbortSignal>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl AbortNotifier for FakeNotifier {
    async fn notified(&self) {
        loop {
            let wake = self.signal.notify.notified();
            if self.signal.is_set() {
                return;
            }
            wake.await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
