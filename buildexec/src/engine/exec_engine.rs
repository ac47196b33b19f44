//! The engine for builds compiled by [`StepBuilder`].

use super::tracked::TrackedStates;
use super::{Engine, Runnable};
use crate::builder::{StepBuilder, SUPPORTED_SCHEMA};
use crate::cancellation::CancellationToken;
use crate::core::{BuildStatus, Event, Origin};
use crate::db::{AbortNotifier, Build, Lock};
use crate::errors::{ExecError, Result};
use crate::exec::{panic_message, BoxStep, RunState, Stepper};
use crate::observability::{BuildLabels, MetricEvent, MetricsEmitter, NoOpMetricsEmitter};
use crate::plan::Plan;
use crate::utils::{Clock, SystemClock};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Reason given to a step's token when its build is aborted.
const ABORT_REASON: &str = "aborted";

/// Runs builds of schema `exec.v2`.
///
/// Clones share the same tracked states and release signal.
#[derive(Clone)]
pub struct ExecEngine {
    builder: StepBuilder,
    lease: Duration,
    enable_redaction: bool,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsEmitter>,
    tracked: TrackedStates,
    /// Tokens of the builds whose step is running in this process.
    running: Arc<DashMap<i64, CancellationToken>>,
    drained: Arc<Notify>,
    release: CancellationToken,
}

impl ExecEngine {
    /// Creates an engine compiling plans with `builder`. Lease and redaction
    /// settings come from the builder's config.
    #[must_use]
    pub fn new(builder: StepBuilder) -> Self {
        let lease = builder.config().tracking_lock_lease;
        let enable_redaction = builder.config().enable_redaction;
        Self {
            builder,
            lease,
            enable_redaction,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoOpMetricsEmitter),
            tracked: TrackedStates::new(),
            running: Arc::new(DashMap::new()),
            drained: Arc::new(Notify::new()),
            release: CancellationToken::new(),
        }
    }

    /// Sets the clock used to timestamp engine events.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets where build metrics go.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shares `tracked` instead of a private map.
    #[must_use]
    pub fn with_tracked_states(mut self, tracked: TrackedStates) -> Self {
        self.tracked = tracked;
        self
    }

    /// Run states of the builds this engine is tracking.
    pub fn tracked_states(&self) -> &TrackedStates {
        &self.tracked
    }

    /// Wraps `build`.
    #[must_use]
    pub fn build(&self, build: Arc<dyn Build>) -> ExecBuild {
        ExecBuild {
            build,
            engine: self.clone(),
        }
    }

    fn stop_running(&self, build_id: i64) {
        self.running.remove(&build_id);
        self.drained.notify_waiters();
    }
}

impl fmt::Debug for ExecEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecEngine")
            .field("lease", &self.lease)
            .field("tracked", &self.tracked)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Engine for ExecEngine {
    fn schema(&self) -> String {
        SUPPORTED_SCHEMA.to_string()
    }

    async fn create_build(&self, build: Arc<dyn Build>, plan: &Plan) -> Result<Box<dyn Runnable>> {
        let runnable = self.build(Arc::clone(&build));

        let started = build.start(SUPPORTED_SCHEMA, plan).await?;
        if !started {
            info!(build_id = build.id(), "build-not-started");
            runnable.abort().await?;
        }

        Ok(Box::new(runnable))
    }

    fn lookup_build(&self, build: Arc<dyn Build>) -> Result<Box<dyn Runnable>> {
        Ok(Box::new(self.build(build)))
    }

    async fn release_all(&self) {
        info!(running = self.running.len(), "releasing-builds");
        self.release.cancel("released");

        loop {
            let drained = self.drained.notified();
            if self.running.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

/// How a step run ended, as far as the engine is concerned.
enum Completion {
    Finished(Result<bool>),
    Released,
}

/// One build driven by an [`ExecEngine`].
pub struct ExecBuild {
    build: Arc<dyn Build>,
    engine: ExecEngine,
}

impl ExecBuild {
    async fn track(&self, lock: Box<dyn Lock>) {
        self.track_locked().await;

        if let Err(err) = lock.release().await {
            warn!(build_id = self.build.id(), error = %err, "failed-to-release-tracking-lock");
        }
    }

    async fn track_locked(&self) {
        let build_id = self.build.id();

        match self.build.reload().await {
            Ok(true) => {}
            Ok(false) => {
                info!(build_id, "build-not-found");
                return;
            }
            Err(err) => {
                error!(build_id, error = %err, "failed-to-load-build-from-db");
                return;
            }
        }

        if !self.build.is_running() {
            info!(build_id, status = %self.build.status(), "build-already-finished");
            return;
        }

        let notifier = match self.build.abort_notifier().await {
            Ok(notifier) => notifier,
            Err(err) => {
                error!(build_id, error = %err, "failed-to-listen-for-aborts");
                return;
            }
        };

        self.run(notifier.as_ref()).await;

        if let Err(err) = notifier.close().await {
            warn!(build_id, error = %err, "failed-to-close-abort-notifier");
        }
    }

    async fn prepare(&self) -> Result<(BoxStep, RunState)> {
        let engine = &self.engine;
        let stepper = engine.builder.stepper_for_build(Arc::clone(&self.build))?;
        let credentials = self.build.variables().await?;

        let step = stepper.step_for(&self.build.private_plan());
        let state = engine.tracked.get_or_insert_with(self.build.id(), || {
            RunState::new(Arc::new(stepper), credentials, engine.enable_redaction)
        });
        Ok((step, state))
    }

    async fn run(&self, notifier: &dyn AbortNotifier) {
        let build_id = self.build.id();
        let engine = &self.engine;

        let (step, state) = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(build_id, error = %err, "failed-to-create-build-step");
                self.save_error(&err).await;
                return;
            }
        };

        if engine.release.is_cancelled() {
            info!(build_id, "engine-released");
            return;
        }

        let ctx = CancellationToken::new();
        engine.running.insert(build_id, ctx.clone());
        engine.metrics.emit(MetricEvent::BuildStarted {
            labels: BuildLabels::for_build(self.build.as_ref()),
        });
        debug!(build_id, "running-build");

        let step_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move {
            match AssertUnwindSafe(step.run(&step_ctx, &state)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(build_id, panic = %message, "build-step-panicked");
                    Err(ExecError::Panicked(message))
                }
            }
        });

        let mut aborted = false;
        let completion = loop {
            tokio::select! {
                biased;
                joined = &mut handle => {
                    break Completion::Finished(joined.unwrap_or_else(|err| {
                        Err(ExecError::Panicked(err.to_string()))
                    }));
                }
                () = notifier.notified(), if !aborted => {
                    info!(build_id, "aborting");
                    aborted = true;
                    ctx.cancel(ABORT_REASON);
                }
                () = engine.release.cancelled() => break Completion::Released,
            }
        };

        match completion {
            Completion::Released => info!(build_id, "releasing"),
            Completion::Finished(outcome) => self.finish(outcome).await,
        }

        self.engine.stop_running(build_id);
    }

    async fn finish(&self, outcome: Result<bool>) {
        let build_id = self.build.id();
        let engine = &self.engine;

        let saved = match outcome {
            Ok(true) => self.build.finish(BuildStatus::Succeeded).await,
            Ok(false) => self.build.finish(BuildStatus::Failed).await,
            Err(err) if err.is_cancelled() => self.build.finish(BuildStatus::Aborted).await,
            Err(err) if err.is_retriable() && !self.build.is_check() => {
                info!(build_id, error = %err, "build-will-be-rerun");
                engine.tracked.remove(build_id);
                return;
            }
            Err(err) => {
                info!(build_id, error = %err, "build-errored");
                self.build.finish_with_error(&err).await
            }
        };

        engine.tracked.remove(build_id);

        if let Err(err) = saved {
            error!(build_id, error = %err, "failed-to-finish-build");
            return;
        }

        match self.build.reload().await {
            Ok(true) => engine.metrics.emit(MetricEvent::finished(self.build.as_ref())),
            Ok(false) => info!(build_id, "build-removed"),
            Err(err) => warn!(build_id, error = %err, "failed-to-reload-finished-build"),
        }
    }

    async fn save_error(&self, err: &ExecError) {
        let event = Event::Error {
            time: self.engine.clock.unix(),
            origin: Origin::new(self.build.private_plan().id),
            message: err.to_string(),
        };
        if let Err(save_err) = self.build.save_event(event).await {
            error!(build_id = self.build.id(), error = %save_err, "failed-to-save-error-event");
        }
    }
}

impl fmt::Debug for ExecBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecBuild")
            .field("build_id", &self.build.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runnable for ExecBuild {
    fn build_id(&self) -> i64 {
        self.build.id()
    }

    async fn resume(&self) {
        let build_id = self.build.id();

        match self.build.acquire_tracking_lock(self.engine.lease).await {
            Ok(Some(lock)) => self.track(lock).await,
            Ok(None) => debug!(build_id, "build-already-tracked"),
            Err(err) => error!(build_id, error = %err, "failed-to-get-lock"),
        }
    }

    async fn abort(&self) -> Result<()> {
        let build_id = self.build.id();
        info!(build_id, "marking-build-aborted");
        self.build.mark_as_aborted().await?;

        if let Some(ctx) = self.engine.running.get(&build_id) {
            ctx.cancel(ABORT_REASON);
        }
        Ok(())
    }
}
