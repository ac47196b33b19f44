//! Delegate for task steps.

use super::build_step::{forward_build_step_delegate, BuildDelegate};
use crate::core::Event;
use crate::exec::{ExitStatus, TaskDelegate};
use crate::plan::TaskConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// Reports task lifecycle events carrying the task's config.
#[derive(Debug)]
pub struct TaskStepDelegate {
    inner: BuildDelegate,
    config: Mutex<TaskConfig>,
}

impl TaskStepDelegate {
    /// Wraps a build delegate.
    #[must_use]
    pub fn new(inner: BuildDelegate) -> Self {
        Self {
            inner,
            config: Mutex::new(TaskConfig::default()),
        }
    }

    /// The config with every tracked credential replaced.
    fn redacted_config(&self) -> TaskConfig {
        let config = self.config.lock().clone();
        let tracker = self.inner.state.credential_tracker();
        serde_json::to_value(&config)
            .and_then(|raw| serde_json::from_value(tracker.redact_value(&raw)))
            .unwrap_or(config)
    }
}

forward_build_step_delegate!(TaskStepDelegate, inner);

#[async_trait]
impl TaskDelegate for TaskStepDelegate {
    fn set_task_config(&self, config: TaskConfig) {
        *self.config.lock() = config;
    }

    async fn task_initializing(&self) {
        self.inner
            .save(Event::InitializeTask {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                config: self.redacted_config(),
            })
            .await;
        info!(plan_id = %self.inner.plan_id, "initializing");
    }

    async fn task_starting(&self) {
        self.inner
            .save(Event::StartTask {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                config: self.redacted_config(),
            })
            .await;
        info!(plan_id = %self.inner.plan_id, "starting");
    }

    async fn task_finished(&self, exit_status: ExitStatus) {
        self.inner
            .save(Event::FinishTask {
                time: self.inner.clock.unix(),
                origin: self.inner.origin(),
                exit_status,
            })
            .await;
        info!(plan_id = %self.inner.plan_id, exit_status, "finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TaskRunConfig;
    use crate::testing::{delegate_factory, run_state, FakeBuild};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config() -> TaskConfig {
        TaskConfig {
            platform: "some-platform".to_string(),
            run: TaskRunConfig {
                path: "some-foo-path".to_string(),
                dir: "some-bar-dir".to_string(),
                ..TaskRunConfig::default()
            },
            params: [("TOKEN".to_string(), "super-secret-source".to_string())]
                .into_iter()
                .collect(),
            ..TaskConfig::default()
        }
    }

    #[tokio::test]
    async fn test_events_carry_redacted_config() {
        let build = FakeBuild::new(1);
        let state = run_state();
        state
            .credential_tracker()
            .track("source-param", &json!("super-secret-source"));

        let delegate = delegate_factory(&build, "some-plan-id").task_delegate(&state);
        delegate.set_task_config(config());
        delegate.task_initializing().await;
        delegate.task_starting().await;
        delegate.task_finished(3).await;

        let events = build.events();
        let kinds: Vec<_> = events.iter().map(Event::event_type).collect();
        assert_eq!(kinds, vec!["initialize_task", "start_task", "finish_task"]);

        let Event::InitializeTask { config, origin, .. } = &events[0] else {
            panic!("expected initialize_task");
        };
        assert_eq!(origin.id.as_str(), "some-plan-id");
        assert_eq!(config.platform, "some-platform");
        assert_eq!(config.params["TOKEN"], "((redacted))");

        assert!(matches!(events[2], Event::FinishTask { exit_status: 3, .. }));
    }
}
