//! Running a substep for every combination of var values.

use super::{BoxStep, BuildStepDelegateFactory, RunState, Step};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::plan::AcrossVar;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// One combination of var values and its compiled substep.
#[derive(Debug)]
pub struct ScopedStep {
    /// The substep.
    pub step: BoxStep,
    /// One value per var, in var order.
    pub values: Vec<Value>,
}

/// Runs substeps for the cartesian product of the vars' values.
///
/// Vars are expanded outermost first. Each var level runs its values with
/// that var's own `max_in_flight`, and each combination runs in a fresh
/// scope with every var bound as a local var.
#[derive(Debug)]
pub struct AcrossStep {
    vars: Vec<AcrossVar>,
    steps: Vec<ScopedStep>,
    fail_fast: bool,
    delegates: Arc<dyn BuildStepDelegateFactory>,
}

impl AcrossStep {
    /// Creates the step. `steps` must be in row-major order of the vars.
    #[must_use]
    pub fn new(
        vars: Vec<AcrossVar>,
        steps: Vec<ScopedStep>,
        fail_fast: bool,
        delegates: Arc<dyn BuildStepDelegateFactory>,
    ) -> Self {
        Self {
            vars,
            steps,
            fail_fast,
            delegates,
        }
    }

    fn run_level<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        state: &'a RunState,
        level: usize,
        steps: &'a [ScopedStep],
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if level == self.vars.len() {
                return match steps.first() {
                    Some(scoped) => self.run_leaf(ctx, state, scoped).await,
                    None => Ok(true),
                };
            }

            let var = &self.vars[level];
            let values = var.values.len();
            if values == 0 || steps.is_empty() {
                return Ok(true);
            }

            let chunk = steps.len().div_ceil(values);
            let limit = var.max_in_flight.unwrap_or_default().effective(values);

            let mut pending = steps.chunks(chunk);
            let mut running = FuturesUnordered::new();
            for group in pending.by_ref().take(limit) {
                running.push(self.run_level(ctx, state, level + 1, group));
            }

            let mut succeeded = true;
            let mut errors = Vec::new();
            while let Some(result) = running.next().await {
                match result {
                    Ok(ok) => succeeded &= ok,
                    Err(err) => {
                        succeeded = false;
                        errors.push(err);
                    }
                }

                if (!succeeded && self.fail_fast) || ctx.is_cancelled() {
                    continue;
                }
                if let Some(group) = pending.next() {
                    running.push(self.run_level(ctx, state, level + 1, group));
                }
            }

            ctx.check()?;
            match errors.len() {
                0 => Ok(succeeded),
                1 => Err(errors.remove(0)),
                _ => Err(ExecError::Multiple(errors)),
            }
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        ctx: &CancellationToken,
        state: &RunState,
        scoped: &ScopedStep,
    ) -> Result<bool> {
        let scope = state.new_local_scope();
        for (var, value) in self.vars.iter().zip(&scoped.values) {
            // Values come from static lists or var-source listings, which are public.
            scope.add_local_var(&var.var, value.clone(), false);
        }

        match AssertUnwindSafe(scoped.step.run(ctx, &scope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "across substep panicked");
                Err(ExecError::Panicked(message))
            }
        }
    }
}

#[async_trait]
impl Step for AcrossStep {
    async fn run(&self, ctx: &CancellationToken, state: &RunState) -> Result<bool> {
        let delegate = self.delegates.build_step_delegate(state);
        delegate.initializing().await;

        let mut stderr = delegate.stderr();
        for var in &self.vars {
            if state.local_var(&var.var).is_some() {
                let warning = format!(
                    "\x1b[1;33mWARNING: across step shadows local var '{}'\x1b[0m\n",
                    var.var
                );
                stderr.write(warning.as_bytes()).await?;
            }
        }
        stderr.close().await?;

        delegate.starting().await;
        let succeeded = self.run_level(ctx, state, 0, &self.steps).await?;
        delegate.finished(succeeded).await;

        Ok(succeeded)
    }
}

/// Extracts the message carried by a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Event;
    use crate::plan::MaxInFlight;
    use crate::testing::{delegate_factory, run_state, FakeBuild, FakeStep, PanickingStep, VarProbe};
    use serde_json::json;

    fn var(name: &str, values: &[Value], max_in_flight: Option<MaxInFlight>) -> AcrossVar {
        AcrossVar {
            var: name.to_string(),
            values: values.to_vec(),
            max_in_flight,
        }
    }

    fn scoped(step: impl Step + 'static, values: Vec<Value>) -> ScopedStep {
        ScopedStep {
            step: Box::new(step),
            values,
        }
    }

    fn across(build: &FakeBuild, vars: Vec<AcrossVar>, steps: Vec<ScopedStep>, fail_fast: bool) -> AcrossStep {
        AcrossStep::new(vars, steps, fail_fast, Arc::new(delegate_factory(build, "across")))
    }

    #[tokio::test]
    async fn test_binds_each_combination() {
        let build = FakeBuild::new(1);
        let probe = VarProbe::new(&["a", "b"]);
        let vars = vec![
            var("a", &[json!(1), json!(2)], None),
            var("b", &[json!("x"), json!("y")], Some(MaxInFlight { all: true, limit: 0 })),
        ];
        let steps = vec![
            scoped(probe.clone(), vec![json!(1), json!("x")]),
            scoped(probe.clone(), vec![json!(1), json!("y")]),
            scoped(probe.clone(), vec![json!(2), json!("x")]),
            scoped(probe.clone(), vec![json!(2), json!("y")]),
        ];

        let ok = across(&build, vars, steps, false)
            .run(&CancellationToken::new(), &run_state())
            .await
            .unwrap();
        assert!(ok);

        let mut seen = probe.seen();
        seen.sort_by_key(ToString::to_string);
        assert_eq!(
            seen,
            vec![
                json!([1, "x"]),
                json!([1, "y"]),
                json!([2, "x"]),
                json!([2, "y"]),
            ]
        );

        let kinds: Vec<_> = build.events().iter().map(Event::event_type).collect();
        assert_eq!(kinds, vec!["initialize", "start", "finish"]);
    }

    #[tokio::test]
    async fn test_vars_do_not_leak_into_parent_scope() {
        let build = FakeBuild::new(1);
        let state = run_state();
        let step = across(
            &build,
            vec![var("a", &[json!(1)], None)],
            vec![scoped(FakeStep::succeeding(), vec![json!(1)])],
            false,
        );
        step.run(&CancellationToken::new(), &state).await.unwrap();
        assert!(state.local_var("a").is_none());
    }

    #[tokio::test]
    async fn test_fail_fast_stops_remaining_values() {
        let build = FakeBuild::new(1);
        let later = FakeStep::succeeding();
        let step = across(
            &build,
            vec![var("a", &[json!(1), json!(2), json!(3)], None)],
            vec![
                scoped(FakeStep::failing(), vec![json!(1)]),
                scoped(later.clone(), vec![json!(2)]),
                scoped(later.clone(), vec![json!(3)]),
            ],
            true,
        );

        assert!(!step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        assert_eq!(later.runs(), 0);
    }

    #[tokio::test]
    async fn test_without_fail_fast_everything_runs() {
        let build = FakeBuild::new(1);
        let later = FakeStep::succeeding();
        let step = across(
            &build,
            vec![var("a", &[json!(1), json!(2)], None)],
            vec![
                scoped(FakeStep::failing(), vec![json!(1)]),
                scoped(later.clone(), vec![json!(2)]),
            ],
            false,
        );

        assert!(!step.run(&CancellationToken::new(), &run_state()).await.unwrap());
        assert_eq!(later.runs(), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let build = FakeBuild::new(1);
        let step = across(
            &build,
            vec![var("a", &[json!(1)], None)],
            vec![scoped(PanickingStep::new("something went wrong"), vec![json!(1)])],
            false,
        );

        let err = step.run(&CancellationToken::new(), &run_state()).await.unwrap_err();
        assert!(matches!(&err, ExecError::Panicked(msg) if msg == "something went wrong"));
    }

    #[tokio::test]
    async fn test_warns_when_shadowing_local_var() {
        let build = FakeBuild::new(1);
        let state = run_state();
        state.add_local_var("a", json!("outer"), false);

        let step = across(
            &build,
            vec![var("a", &[json!(1)], None)],
            vec![scoped(FakeStep::succeeding(), vec![json!(1)])],
            false,
        );
        step.run(&CancellationToken::new(), &state).await.unwrap();

        assert!(build.events().iter().any(|e| matches!(
            e,
            Event::Log { payload, .. } if payload.contains("WARNING: across step shadows local var 'a'")
        )));
    }
}
