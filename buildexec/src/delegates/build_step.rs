//! The delegate every step kind builds on.

use super::image::ArtifactSourcer;
use super::policy::{PolicyChecker, PolicyInput, ACTION_USE_IMAGE};
use crate::cancellation::CancellationToken;
use crate::core::{Event, Origin, OriginSource};
use crate::db::Build;
use crate::errors::{ExecError, Result};
use crate::events::EventWriter;
use crate::exec::{BuildStepDelegate, GetResult, ImageSpec, RunState};
use crate::plan::{
    CheckPlan, GetPlan, ImageResource, Plan, PlanId, PlanStep, ResourceTypeConfig, Version,
};
use crate::utils::Clock;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const DEFAULT_IMAGE_NAME: &str = "image";

/// Records a step's lifecycle and output on its build.
#[derive(Clone)]
pub struct BuildDelegate {
    pub(crate) build: Arc<dyn Build>,
    pub(crate) plan_id: PlanId,
    pub(crate) state: RunState,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: Arc<dyn PolicyChecker>,
    sourcer: Arc<dyn ArtifactSourcer>,
    flush_interval: Duration,
}

impl BuildDelegate {
    /// Creates a delegate for the step `plan_id` of `build`.
    #[must_use]
    pub fn new(
        build: Arc<dyn Build>,
        plan_id: PlanId,
        state: RunState,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn PolicyChecker>,
        sourcer: Arc<dyn ArtifactSourcer>,
    ) -> Self {
        Self {
            build,
            plan_id,
            state,
            clock,
            policy,
            sourcer,
            flush_interval: crate::events::DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Sets how long redacted output may be held without a line break.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub(crate) fn origin(&self) -> Origin {
        Origin::new(self.plan_id.clone())
    }

    /// Saves an event, logging rather than returning a failure.
    pub(crate) async fn save(&self, event: Event) {
        let event_type = event.event_type();
        if let Err(err) = self.build.save_event(event).await {
            error!(
                build_id = self.build.id(),
                plan_id = %self.plan_id,
                event = event_type,
                error = %err,
                "failed-to-save-{event_type}-event"
            );
        }
    }

    fn writer(&self, source: OriginSource) -> EventWriter {
        let writer = EventWriter::new(
            Arc::clone(&self.build),
            self.origin().with_source(source),
            Arc::clone(&self.clock),
        )
        .with_flush_interval(self.flush_interval);

        if self.state.redaction_enabled() {
            let state = self.state.clone();
            writer.with_filter(Arc::new(move |text: &str| state.redact(text)))
        } else {
            writer
        }
    }

    async fn check_image_policy(&self, image: &ImageResource, privileged: bool) -> Result<()> {
        if !self.policy.should_check_action(ACTION_USE_IMAGE) {
            return Ok(());
        }

        let source = self
            .state
            .credential_tracker()
            .redact_value(&Value::Object(image.source.clone()));

        let input = PolicyInput {
            action: ACTION_USE_IMAGE.to_string(),
            team: self.build.team_name(),
            pipeline: self.build.pipeline_name(),
            data: json!({
                "image_type": image.resource_type,
                "image_source": source,
                "privileged": privileged,
            }),
        };

        let result = self
            .policy
            .check(input)
            .await
            .map_err(|err| ExecError::PolicyCheck(err.to_string()))?;

        if result.allowed {
            return Ok(());
        }
        if result.should_block {
            return Err(ExecError::PolicyCheckFailed(result.messages));
        }

        self.warn_soft_policy_failure(&result.messages).await
    }

    /// Writes the violated policies to stderr and lets the step carry on.
    pub(crate) async fn warn_soft_policy_failure(&self, messages: &[String]) -> Result<()> {
        let mut stderr = self.writer(OriginSource::Stderr);

        let mut report = String::from("\x1b[1;31mpolicy check failed\x1b[0m\n");
        for message in messages {
            report.push_str(&format!(" * {message}\n"));
        }
        stderr.write(report.as_bytes()).await?;
        stderr
            .write(b"\n\x1b[1;33mWARNING: unblocking from the policy check failure for soft enforcement\x1b[0m\n")
            .await?;
        stderr.close().await
    }

    async fn check_image_version(
        &self,
        ctx: &CancellationToken,
        scope: &RunState,
        name: &str,
        image: &ImageResource,
        resource_types: &[ResourceTypeConfig],
    ) -> Result<Version> {
        let check = Plan::new(
            self.plan_id.child("image-check"),
            PlanStep::Check(CheckPlan {
                name: name.to_string(),
                resource_type: image.resource_type.clone(),
                source: image.source.clone(),
                resource_types: resource_types.to_vec(),
                tags: image.tags.clone(),
                ..CheckPlan::default()
            }),
        );

        self.save(Event::ImageCheck {
            time: self.clock.unix(),
            origin: self.origin(),
            plan: check.public(),
        })
        .await;

        if !scope.run_plan(ctx, &check).await? {
            return Err(ExecError::ImageCheckFailed);
        }

        scope
            .result::<Version>(&check.id)
            .ok_or(ExecError::ImageVersionMissing)
    }
}

#[async_trait]
impl BuildStepDelegate for BuildDelegate {
    fn stdout(&self) -> EventWriter {
        self.writer(OriginSource::Stdout)
    }

    fn stderr(&self) -> EventWriter {
        self.writer(OriginSource::Stderr)
    }

    async fn initializing(&self) {
        self.save(Event::Initialize {
            time: self.clock.unix(),
            origin: self.origin(),
        })
        .await;
        info!(plan_id = %self.plan_id, "initializing");
    }

    async fn starting(&self) {
        self.save(Event::Start {
            time: self.clock.unix(),
            origin: self.origin(),
        })
        .await;
        info!(plan_id = %self.plan_id, "starting");
    }

    async fn finished(&self, succeeded: bool) {
        self.save(Event::Finish {
            time: self.clock.unix(),
            origin: self.origin(),
            succeeded,
        })
        .await;
        info!(plan_id = %self.plan_id, succeeded, "finished");
    }

    async fn errored(&self, message: &str) {
        self.save(Event::Error {
            time: self.clock.unix(),
            origin: self.origin(),
            message: message.to_string(),
        })
        .await;
    }

    async fn fetch_image(
        &self,
        ctx: &CancellationToken,
        image: &ImageResource,
        resource_types: &[ResourceTypeConfig],
        privileged: bool,
    ) -> Result<ImageSpec> {
        self.check_image_policy(image, privileged).await?;

        let name = if image.name.is_empty() {
            DEFAULT_IMAGE_NAME
        } else {
            image.name.as_str()
        };
        let scope = self.state.new_local_scope();

        let version = match &image.version {
            Some(version) => version.clone(),
            None => {
                self.check_image_version(ctx, &scope, name, image, resource_types)
                    .await?
            }
        };

        let get = Plan::new(
            self.plan_id.child("image-get"),
            PlanStep::Get(GetPlan {
                name: name.to_string(),
                resource_type: image.resource_type.clone(),
                source: image.source.clone(),
                params: image.params.clone(),
                version: Some(version),
                resource_types: resource_types.to_vec(),
                tags: image.tags.clone(),
                ..GetPlan::default()
            }),
        );

        self.save(Event::ImageGet {
            time: self.clock.unix(),
            origin: self.origin(),
            plan: get.public(),
        })
        .await;

        if !scope.run_plan(ctx, &get).await? {
            return Err(ExecError::ImageGetFailed);
        }

        let fetched = scope
            .result::<GetResult>(&get.id)
            .ok_or(ExecError::ImageGetFailed)?;
        self.build
            .save_image_resource_version(&fetched.resource_cache)
            .await?;

        let artifact = scope
            .artifact_repository()
            .artifact_for(name)
            .ok_or_else(|| ExecError::ArtifactNotFound(name.to_string()))?;
        let source = self.sourcer.source_image(&artifact).await?;

        Ok(ImageSpec {
            artifact,
            source,
            privileged,
        })
    }
}

impl fmt::Debug for BuildDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildDelegate")
            .field("build_id", &self.build.id())
            .field("plan_id", &self.plan_id)
            .finish_non_exhaustive()
    }
}

/// Forwards [`BuildStepDelegate`] to an inner [`BuildDelegate`] field.
macro_rules! forward_build_step_delegate {
    ($ty:ty, $field:ident) => {
        #[async_trait::async_trait]
        impl $crate::exec::BuildStepDelegate for $ty {
            fn stdout(&self) -> $crate::events::EventWriter {
                $crate::exec::BuildStepDelegate::stdout(&self.$field)
            }

            fn stderr(&self) -> $crate::events::EventWriter {
                $crate::exec::BuildStepDelegate::stderr(&self.$field)
            }

            async fn initializing(&self) {
                $crate::exec::BuildStepDelegate::initializing(&self.$field).await;
            }

            async fn starting(&self) {
                $crate::exec::BuildStepDelegate::starting(&self.$field).await;
            }

            async fn finished(&self, succeeded: bool) {
                $crate::exec::BuildStepDelegate::finished(&self.$field, succeeded).await;
            }

            async fn errored(&self, message: &str) {
                $crate::exec::BuildStepDelegate::errored(&self.$field, message).await;
            }

            async fn fetch_image(
                &self,
                ctx: &$crate::cancellation::CancellationToken,
                image: &$crate::plan::ImageResource,
                resource_types: &[$crate::plan::ResourceTypeConfig],
                privileged: bool,
            ) -> $crate::errors::Result<$crate::exec::ImageSpec> {
                $crate::exec::BuildStepDelegate::fetch_image(
                    &self.$field,
                    ctx,
                    image,
                    resource_types,
                    privileged,
                )
                .await
            }
        }
    };
}

pub(crate) use forward_build_step_delegate;
