//! Benchmarks for plan compilation.

use buildexec::builder::{CoreStepFactory, StepBuilder, SUPPORTED_SCHEMA};
use buildexec::config::EngineConfig;
use buildexec::db::Build;
use buildexec::delegates::DelegateFactory;
use buildexec::exec::{BoxStep, ContainerMetadata, IdentityStep, StepMetadata, Stepper};
use buildexec::plan::{HookPlan, InParallelPlan, Plan, PlanStep, TaskPlan};
use buildexec::testing::FakeBuild;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

/// Compiles every leaf to a no-op without recording anything.
struct IdentityFactory;

impl CoreStepFactory for IdentityFactory {
    fn get_step(&self, _: &Plan, _: StepMetadata, _: ContainerMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn put_step(&self, _: &Plan, _: StepMetadata, _: ContainerMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn task_step(&self, _: &Plan, _: StepMetadata, _: ContainerMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn run_step(&self, _: &Plan, _: StepMetadata, _: ContainerMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn check_step(&self, _: &Plan, _: StepMetadata, _: ContainerMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn set_pipeline_step(&self, _: &Plan, _: StepMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn load_var_step(&self, _: &Plan, _: StepMetadata, _: DelegateFactory) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn artifact_input_step(&self, _: &Plan, _: Arc<dyn Build>) -> BoxStep {
        Box::new(IdentityStep)
    }

    fn artifact_output_step(&self, _: &Plan, _: Arc<dyn Build>) -> BoxStep {
        Box::new(IdentityStep)
    }
}

fn task(id: String) -> Plan {
    Plan::new(
        id.clone(),
        PlanStep::Task(TaskPlan {
            name: id,
            ..TaskPlan::default()
        }),
    )
}

/// A retry of `width` parallel branches, each a `Do` of `depth` tasks with
/// an ensure hook.
fn wide_plan(width: usize, depth: usize) -> Plan {
    let branches = (0..width)
        .map(|b| {
            let tasks = (0..depth).map(|t| task(format!("task-{b}-{t}"))).collect();
            Plan::new(
                format!("ensure-{b}"),
                PlanStep::Ensure(HookPlan {
                    step: Box::new(Plan::new(format!("do-{b}"), PlanStep::Do(tasks))),
                    next: Box::new(task(format!("cleanup-{b}"))),
                }),
            )
        })
        .collect();

    let parallel = Plan::new(
        "parallel",
        PlanStep::InParallel(InParallelPlan {
            steps: branches,
            ..InParallelPlan::default()
        }),
    );
    Plan::new("retry", PlanStep::Retry(vec![parallel.clone(), parallel]))
}

fn compile_benchmark(c: &mut Criterion) {
    let builder = StepBuilder::new(Arc::new(IdentityFactory), EngineConfig::default());
    let build = FakeBuild::new(1).with_schema(SUPPORTED_SCHEMA);
    let stepper = builder
        .stepper_for_build(Arc::new(build))
        .expect("schema is supported");

    let mut group = c.benchmark_group("compile");
    for width in [4, 16, 64] {
        let plan = wide_plan(width, 8);
        group.bench_with_input(BenchmarkId::from_parameter(width), &plan, |b, plan| {
            b.iter(|| black_box(stepper.step_for(plan)));
        });
    }
    group.finish();
}

criterion_group!(benches, compile_benchmark);
criterion_main!(benches);
