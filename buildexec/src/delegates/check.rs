//! Delegate for check steps.
//!
//! Decides whether a check runs or reuses the last recorded result, and
//! keeps the scope's check bookkeeping current.

use super::build_step::{forward_build_step_delegate, BuildDelegate};
use super::rate_limiter::RateLimiter;
use crate::cancellation::CancellationToken;
use crate::db::{LastCheck, Lock, NoopLock, ResourceConfig, ResourceConfigScope};
use crate::errors::{ExecError, Result};
use crate::exec::CheckDelegate;
use crate::plan::{CheckInterval, CheckPlan};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Check delegate backed by a build.
pub struct CheckStepDelegate {
    inner: BuildDelegate,
    plan: CheckPlan,
    limiter: Arc<dyn RateLimiter>,
    default_interval: Duration,
    lock_retry_interval: Duration,
}

impl CheckStepDelegate {
    /// Creates a delegate for `plan`.
    #[must_use]
    pub fn new(
        inner: BuildDelegate,
        plan: CheckPlan,
        limiter: Arc<dyn RateLimiter>,
        default_interval: Duration,
        lock_retry_interval: Duration,
    ) -> Self {
        Self {
            inner,
            plan,
            limiter,
            default_interval,
            lock_retry_interval,
        }
    }

    fn interval(&self) -> Result<CheckInterval> {
        Ok(match self.plan.check_interval()? {
            CheckInterval::Default => CheckInterval::Every(self.default_interval),
            other => other,
        })
    }

    fn should_run(&self, last: &LastCheck, interval: Duration, now: DateTime<Utc>) -> bool {
        let build = &self.inner.build;

        if !self.plan.is_periodic() {
            return !last.succeeded || build.start_time().map_or(false, |start| last.end_time < start);
        }

        if build.is_manually_triggered() {
            return self.plan.from_version.is_some()
                || !last.succeeded
                || build.create_time() > last.start_time;
        }

        now >= after(last.end_time, interval)
    }

    async fn acquire_lock(
        &self,
        ctx: &CancellationToken,
        scope: &dyn ResourceConfigScope,
        interval: Duration,
        manual: bool,
    ) -> Result<Option<Box<dyn Lock>>> {
        loop {
            ctx.check()?;

            let last = scope.last_check().await?;
            if !manual && self.inner.clock.now() < after(last.end_time, interval) {
                return Ok(None);
            }

            if let Some(lock) = scope.acquire_resource_checking_lock().await? {
                return Ok(Some(lock));
            }

            debug!(scope_id = scope.id(), "checking-lock-held");
            tokio::select! {
                () = self.inner.clock.sleep(self.lock_retry_interval) => {}
                () = ctx.cancelled() => {}
            }
        }
    }
}

forward_build_step_delegate!(CheckStepDelegate, inner);

impl fmt::Debug for CheckStepDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckStepDelegate")
            .field("inner", &self.inner)
            .field("resource", &self.plan.resource)
            .field("interval", &self.plan.interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CheckDelegate for CheckStepDelegate {
    async fn find_or_create_scope(
        &self,
        config: &dyn ResourceConfig,
    ) -> Result<Arc<dyn ResourceConfigScope>> {
        if self.plan.resource.is_empty() {
            return config.find_or_create_scope(None).await;
        }

        let pipeline = self
            .inner
            .build
            .pipeline()
            .await?
            .ok_or(ExecError::PipelineNotFound)?;
        let resource = pipeline
            .resource(&self.plan.resource)
            .await?
            .ok_or_else(|| ExecError::ResourceNotFound(self.plan.resource.clone()))?;

        config.find_or_create_scope(Some(resource.id())).await
    }

    async fn wait_to_run(
        &self,
        ctx: &CancellationToken,
        scope: &dyn ResourceConfigScope,
    ) -> Result<(Box<dyn Lock>, bool)> {
        let manual = self.inner.build.is_manually_triggered();
        let periodic = self.plan.is_periodic();

        if periodic && !manual {
            self.limiter.wait(ctx).await?;
        }

        let interval = match self.interval()? {
            CheckInterval::Never if !manual => return Ok((Box::new(NoopLock), false)),
            CheckInterval::Every(interval) => interval,
            CheckInterval::Never | CheckInterval::Default => self.default_interval,
        };

        let lock: Box<dyn Lock> = if periodic {
            match self.acquire_lock(ctx, scope, interval, manual).await? {
                Some(lock) => lock,
                None => return Ok((Box::new(NoopLock), false)),
            }
        } else {
            Box::new(NoopLock)
        };

        let last = match scope.last_check().await {
            Ok(last) => last,
            Err(err) => {
                release(lock.as_ref()).await;
                return Err(err);
            }
        };

        if self.should_run(&last, interval, self.inner.clock.now()) {
            return Ok((lock, true));
        }

        release(lock.as_ref()).await;
        Ok((Box::new(NoopLock), false))
    }

    async fn point_to_checked_config(&self, scope: &dyn ResourceConfigScope) -> Result<()> {
        if self.plan.resource.is_empty() && self.plan.resource_type_name.is_empty() {
            return Ok(());
        }

        let pipeline = self
            .inner
            .build
            .pipeline()
            .await?
            .ok_or(ExecError::PipelineNotFound)?;

        if !self.plan.resource.is_empty() {
            let resource = pipeline
                .resource(&self.plan.resource)
                .await?
                .ok_or_else(|| ExecError::ResourceNotFound(self.plan.resource.clone()))?;
            return resource.set_resource_config_scope(scope).await;
        }

        let resource_type = pipeline
            .resource_type(&self.plan.resource_type_name)
            .await?
            .ok_or_else(|| ExecError::ResourceTypeNotFound(self.plan.resource_type_name.clone()))?;
        resource_type.set_resource_config_scope(scope).await
    }

    async fn update_scope_last_check_start_time(
        &self,
        scope: &dyn ResourceConfigScope,
        nested: bool,
    ) -> Result<(bool, i64)> {
        let (build_id, plan) = if nested {
            (0, None)
        } else {
            self.inner.build.on_check_build_start().await?;
            (self.inner.build.id(), self.inner.build.public_plan())
        };

        let found = scope.update_last_check_start_time(build_id, plan).await?;
        Ok((found, build_id))
    }

    async fn update_scope_last_check_end_time(
        &self,
        scope: &dyn ResourceConfigScope,
        succeeded: bool,
    ) -> Result<bool> {
        scope.update_last_check_end_time(succeeded).await
    }
}

fn after(time: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

async fn release(lock: &dyn Lock) {
    if let Err(err) = lock.release().await {
        warn!(error = %err, "failed-to-release-checking-lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegates::rate_limiter::MockRateLimiter;
    use crate::testing::{
        delegate_factory, run_state, FakeBuild, FakePipeline, FakeResourceConfig,
        FakeResourceConfigScope,
    };
    use crate::utils::FakeClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0).unwrap()
    }

    fn ago(d: Duration) -> DateTime<Utc> {
        now() - chrono::Duration::from_std(d).unwrap()
    }

    fn periodic_plan() -> CheckPlan {
        CheckPlan {
            name: "some-resource".to_string(),
            resource: "some-resource".to_string(),
            interval: "1m".to_string(),
            ..CheckPlan::default()
        }
    }

    fn limiter(expected_waits: usize) -> Arc<MockRateLimiter> {
        let mut limiter = MockRateLimiter::new();
        limiter.expect_wait().times(expected_waits).returning(|_| Ok(()));
        Arc::new(limiter)
    }

    fn delegate(
        build: &FakeBuild,
        plan: CheckPlan,
        limiter: Arc<MockRateLimiter>,
        clock: &FakeClock,
    ) -> CheckStepDelegate {
        delegate_factory(build, "check-plan")
            .with_clock(Arc::new(clock.clone()))
            .with_rate_limiter(limiter)
            .check_delegate(&run_state(), plan)
    }

    fn scope_checked(end: DateTime<Utc>, succeeded: bool) -> FakeResourceConfigScope {
        FakeResourceConfigScope::new(1).with_last_check(LastCheck {
            start_time: end - chrono::Duration::seconds(5),
            end_time: end,
            succeeded,
        })
    }

    async fn wait(delegate: &CheckStepDelegate, scope: &FakeResourceConfigScope) -> bool {
        let (lock, run) = delegate
            .wait_to_run(&CancellationToken::new(), scope)
            .await
            .unwrap();
        lock.release().await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_periodic_check_within_interval_is_skipped() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL - Duration::from_nanos(1)), true);

        let delegate = delegate(&build, periodic_plan(), limiter(1), &clock);
        assert!(!wait(&delegate, &scope).await);
        assert_eq!(scope.lock_attempts(), 0);
    }

    #[tokio::test]
    async fn test_periodic_check_after_interval_runs() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL), true);

        let delegate = delegate(&build, periodic_plan(), limiter(1), &clock);
        let (lock, run) = delegate
            .wait_to_run(&CancellationToken::new(), &scope)
            .await
            .unwrap();
        assert!(run);
        assert!(scope.is_locked());

        lock.release().await.unwrap();
        assert!(!scope.is_locked());
    }

    #[tokio::test]
    async fn test_default_interval_applies_when_unset() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut plan = periodic_plan();
        plan.interval = String::new();

        let scope = scope_checked(ago(Duration::from_secs(59)), true);
        let d = delegate(&build, plan.clone(), limiter(1), &clock);
        assert!(!wait(&d, &scope).await);

        let scope = scope_checked(ago(Duration::from_secs(60)), true);
        let d = delegate(&build, plan, limiter(1), &clock);
        assert!(wait(&d, &scope).await);
    }

    #[tokio::test]
    async fn test_retries_until_lock_is_free() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL * 2), true).with_lock_held_for(2);

        let delegate = delegate(&build, periodic_plan(), limiter(1), &clock);
        assert!(wait(&delegate, &scope).await);

        assert_eq!(scope.lock_attempts(), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_another_checker_finishing_while_waiting_skips() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL * 2), true).with_lock_held_for(1);

        // The holder records a fresh check while this delegate sleeps.
        let refreshed = scope.clone();
        scope.on_lock_attempt(move || {
            refreshed.set_last_check(LastCheck {
                start_time: now(),
                end_time: now(),
                succeeded: true,
            });
        });

        let delegate = delegate(&build, periodic_plan(), limiter(1), &clock);
        assert!(!wait(&delegate, &scope).await);
        assert_eq!(scope.lock_attempts(), 1);
        assert!(!scope.is_locked());
    }

    #[tokio::test]
    async fn test_never_interval_skips_automatic_checks() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut plan = periodic_plan();
        plan.interval = "never".to_string();

        let scope = scope_checked(ago(INTERVAL * 10), false);
        let delegate = delegate(&build, plan, limiter(1), &clock);
        assert!(!wait(&delegate, &scope).await);
        assert_eq!(scope.last_check_calls(), 0);
    }

    #[tokio::test]
    async fn test_manual_trigger_bypasses_limiter_and_interval() {
        let build = FakeBuild::new(1)
            .with_manually_triggered(true)
            .with_create_time(now());
        let clock = FakeClock::new(now());
        let mut plan = periodic_plan();
        plan.interval = "never".to_string();

        // Checked a moment before the build was created.
        let scope = scope_checked(ago(Duration::from_secs(1)), true);
        let delegate = delegate(&build, plan, limiter(0), &clock);
        assert!(wait(&delegate, &scope).await);
    }

    #[tokio::test]
    async fn test_manual_trigger_skips_when_check_started_after_creation() {
        let build = FakeBuild::new(1)
            .with_manually_triggered(true)
            .with_create_time(ago(Duration::from_secs(30)));
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(Duration::from_secs(1)), true);

        let delegate = delegate(&build, periodic_plan(), limiter(0), &clock);
        assert!(!wait(&delegate, &scope).await);
        assert!(!scope.is_locked());
    }

    #[tokio::test]
    async fn test_manual_trigger_with_from_version_always_runs() {
        let build = FakeBuild::new(1)
            .with_manually_triggered(true)
            .with_create_time(ago(Duration::from_secs(30)));
        let clock = FakeClock::new(now());
        let mut plan = periodic_plan();
        plan.from_version = Some([("ref".to_string(), "v1".to_string())].into_iter().collect());

        let scope = scope_checked(ago(Duration::from_secs(1)), true);
        let delegate = delegate(&build, plan, limiter(0), &clock);
        assert!(wait(&delegate, &scope).await);
    }

    #[tokio::test]
    async fn test_manual_trigger_reruns_failed_check() {
        let build = FakeBuild::new(1)
            .with_manually_triggered(true)
            .with_create_time(ago(Duration::from_secs(30)));
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(Duration::from_secs(1)), false);

        let delegate = delegate(&build, periodic_plan(), limiter(0), &clock);
        assert!(wait(&delegate, &scope).await);
    }

    #[tokio::test]
    async fn test_one_off_check_runs_when_last_check_predates_build() {
        let build = FakeBuild::new(1).with_start_time(ago(Duration::from_secs(10)));
        let clock = FakeClock::new(now());
        let plan = CheckPlan {
            name: "image".to_string(),
            ..CheckPlan::default()
        };

        let scope = scope_checked(ago(Duration::from_secs(20)), true);
        let d = delegate(&build, plan.clone(), limiter(0), &clock);
        assert!(wait(&d, &scope).await);
        assert_eq!(scope.lock_attempts(), 0);

        let scope = scope_checked(ago(Duration::from_secs(5)), true);
        let d = delegate(&build, plan.clone(), limiter(0), &clock);
        assert!(!wait(&d, &scope).await);

        let scope = scope_checked(ago(Duration::from_secs(5)), false);
        let d = delegate(&build, plan, limiter(0), &clock);
        assert!(wait(&d, &scope).await);
    }

    #[tokio::test]
    async fn test_limiter_cancellation_is_returned() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let mut limiter = MockRateLimiter::new();
        limiter
            .expect_wait()
            .returning(|_| Err(ExecError::Cancelled("aborted".to_string())));

        let delegate = delegate(&build, periodic_plan(), Arc::new(limiter), &clock);
        let scope = scope_checked(ago(INTERVAL * 2), true);
        let err = delegate
            .wait_to_run(&CancellationToken::new(), &scope)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_build_stops_waiting_for_held_lock() {
        let build = FakeBuild::new(1)
            .with_manually_triggered(true)
            .with_create_time(now());
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL * 2), true).with_lock_held_for(usize::MAX);

        let ctx = CancellationToken::new();
        ctx.cancel("aborted");

        let delegate = delegate(&build, periodic_plan(), limiter(0), &clock);
        let waited = delegate.wait_to_run(&ctx, &scope);
        let err = tokio::time::timeout(Duration::from_millis(500), waited)
            .await
            .expect("wait_to_run ignored cancellation")
            .err()
            .unwrap();

        assert_eq!(err.cancel_reason(), Some("aborted"));
        assert_eq!(scope.lock_attempts(), 0);
        assert!(!scope.is_locked());
    }

    #[tokio::test]
    async fn test_cancellation_while_retrying_lock_is_returned() {
        let build = FakeBuild::new(1);
        let clock = FakeClock::new(now());
        let scope = scope_checked(ago(INTERVAL * 2), true).with_lock_held_for(usize::MAX);

        let ctx = CancellationToken::new();
        let aborter = ctx.clone();
        scope.on_lock_attempt(move || aborter.cancel("aborted"));

        let delegate = delegate(&build, periodic_plan(), limiter(1), &clock);
        let waited = delegate.wait_to_run(&ctx, &scope);
        let err = tokio::time::timeout(Duration::from_millis(500), waited)
            .await
            .expect("wait_to_run ignored cancellation")
            .err()
            .unwrap();

        assert!(err.is_cancelled());
        assert_eq!(scope.lock_attempts(), 1);
    }

    #[tokio::test]
    async fn test_find_or_create_scope() {
        let pipeline = FakePipeline::new(1, "some-pipeline").with_resource("some-resource", 42);
        let build = FakeBuild::new(1).with_pipeline(pipeline);
        let clock = FakeClock::new(now());
        let config = FakeResourceConfig::new(9);

        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        let scope = d.find_or_create_scope(&config).await.unwrap();
        assert_eq!(scope.resource_id(), Some(42));

        let d = delegate(&build, CheckPlan::default(), limiter(0), &clock);
        let scope = d.find_or_create_scope(&config).await.unwrap();
        assert_eq!(scope.resource_id(), None);
    }

    #[tokio::test]
    async fn test_find_or_create_scope_missing_resource() {
        let build = FakeBuild::new(1).with_pipeline(FakePipeline::new(1, "some-pipeline"));
        let clock = FakeClock::new(now());

        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        let err = d
            .find_or_create_scope(&FakeResourceConfig::new(9))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecError::ResourceNotFound(ref name) if name == "some-resource"));

        let build = FakeBuild::new(2);
        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        let err = d
            .find_or_create_scope(&FakeResourceConfig::new(9))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecError::PipelineNotFound));
    }

    #[tokio::test]
    async fn test_point_to_checked_config() {
        let pipeline = FakePipeline::new(1, "some-pipeline")
            .with_resource("some-resource", 42)
            .with_resource_type("some-type");
        let build = FakeBuild::new(1).with_pipeline(pipeline.clone());
        let clock = FakeClock::new(now());
        let scope = FakeResourceConfigScope::new(7);

        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        d.point_to_checked_config(&scope).await.unwrap();
        assert_eq!(pipeline.resource_scope("some-resource"), Some(7));

        let plan = CheckPlan {
            resource_type_name: "some-type".to_string(),
            ..CheckPlan::default()
        };
        let d = delegate(&build, plan, limiter(0), &clock);
        d.point_to_checked_config(&scope).await.unwrap();
        assert_eq!(pipeline.resource_type_scope("some-type"), Some(7));

        let plan = CheckPlan {
            resource_type_name: "missing-type".to_string(),
            ..CheckPlan::default()
        };
        let d = delegate(&build, plan, limiter(0), &clock);
        let err = d.point_to_checked_config(&scope).await.unwrap_err();
        assert!(matches!(err, ExecError::ResourceTypeNotFound(_)));

        let d = delegate(&FakeBuild::new(2), CheckPlan::default(), limiter(0), &clock);
        d.point_to_checked_config(&scope).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_last_check_start_time() {
        let build = FakeBuild::new(12);
        let clock = FakeClock::new(now());
        let scope = FakeResourceConfigScope::new(7);

        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        assert_eq!(
            d.update_scope_last_check_start_time(&scope, false).await.unwrap(),
            (true, 12)
        );
        assert_eq!(build.check_build_starts(), 1);
        assert_eq!(scope.check_starts()[0].0, 12);

        assert_eq!(
            d.update_scope_last_check_start_time(&scope, true).await.unwrap(),
            (true, 0)
        );
        assert_eq!(build.check_build_starts(), 1);
        assert_eq!(scope.check_starts()[1], (0, None));
    }

    #[tokio::test]
    async fn test_update_last_check_end_time() {
        let build = FakeBuild::new(12);
        let clock = FakeClock::new(now());
        let scope = FakeResourceConfigScope::new(7);

        let d = delegate(&build, periodic_plan(), limiter(0), &clock);
        assert!(d.update_scope_last_check_end_time(&scope, false).await.unwrap());
        assert_eq!(scope.check_ends(), vec![false]);
    }
}
