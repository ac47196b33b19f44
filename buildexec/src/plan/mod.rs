//! The build plan: an immutable tree of typed step specifications.
//!
//! A [`Plan`] node carries a unique [`PlanId`], the attempt path that led to
//! it, and exactly one [`PlanStep`] variant. Plans are produced outside this
//! crate, persisted with the build, and compiled into executable steps by the
//! [`crate::builder::StepBuilder`].

mod steps;

pub use steps::{
    AcrossPlan, AcrossVar, ArtifactInputPlan, ArtifactOutputPlan, CheckInterval, CheckPlan,
    GetPlan, HookPlan, ImageResource, InParallelPlan, LoadVarPlan, MaxInFlight, Params, PutPlan,
    ResourceTypeConfig, RunPlan, SetPipelinePlan, Source, Tags, TaskConfig, TaskPlan,
    TaskRunConfig, TimeoutPlan, TryPlan, VarScopedPlan, Version,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Identifier of a plan node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Creates a plan ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the ID of a synthesized sub-plan, e.g. `"<id>/image-check"`.
    #[must_use]
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}/{suffix}", self.0))
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PlanId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The variant payload of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    /// Run steps concurrently.
    InParallel(InParallelPlan),
    /// Run a substep per combination of var values.
    Across(AcrossPlan),
    /// Run steps in sequence while they succeed.
    Do(Vec<Plan>),
    /// Limit a step's duration.
    Timeout(TimeoutPlan),
    /// Run a step without letting it fail the build.
    Try(TryPlan),
    /// Run a hook when the step is aborted.
    OnAbort(HookPlan),
    /// Run a hook when the step errors.
    OnError(HookPlan),
    /// Run a hook when the step succeeds.
    OnSuccess(HookPlan),
    /// Run a hook when the step fails.
    OnFailure(HookPlan),
    /// Always run a hook after the step.
    Ensure(HookPlan),
    /// Send a message to a prototype.
    Run(RunPlan),
    /// Run a task.
    Task(TaskPlan),
    /// Configure a pipeline.
    SetPipeline(SetPipelinePlan),
    /// Load a file into a var.
    LoadVar(LoadVarPlan),
    /// Check a resource.
    Check(CheckPlan),
    /// Fetch a resource version.
    Get(GetPlan),
    /// Push to a resource.
    Put(PutPlan),
    /// Try each attempt in turn until one succeeds.
    Retry(Vec<Plan>),
    /// Import an uploaded artifact.
    ArtifactInput(ArtifactInputPlan),
    /// Export an artifact.
    ArtifactOutput(ArtifactOutputPlan),
}

impl PlanStep {
    /// Returns the variant name as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InParallel(_) => "in_parallel",
            Self::Across(_) => "across",
            Self::Do(_) => "do",
            Self::Timeout(_) => "timeout",
            Self::Try(_) => "try",
            Self::OnAbort(_) => "on_abort",
            Self::OnError(_) => "on_error",
            Self::OnSuccess(_) => "on_success",
            Self::OnFailure(_) => "on_failure",
            Self::Ensure(_) => "ensure",
            Self::Run(_) => "run",
            Self::Task(_) => "task",
            Self::SetPipeline(_) => "set_pipeline",
            Self::LoadVar(_) => "load_var",
            Self::Check(_) => "check",
            Self::Get(_) => "get",
            Self::Put(_) => "put",
            Self::Retry(_) => "retry",
            Self::ArtifactInput(_) => "artifact_input",
            Self::ArtifactOutput(_) => "artifact_output",
        }
    }

    /// Returns true for variants compiled by the step factory.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(
            self,
            Self::Run(_)
                | Self::Task(_)
                | Self::SetPipeline(_)
                | Self::LoadVar(_)
                | Self::Check(_)
                | Self::Get(_)
                | Self::Put(_)
                | Self::ArtifactInput(_)
                | Self::ArtifactOutput(_)
        )
    }
}

/// A node in the build plan tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique node ID.
    pub id: PlanId,
    /// Retry indices taken to reach this node, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<u32>,
    /// The node's variant. A node without one compiles to a no-op step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<PlanStep>,
}

impl Plan {
    /// Creates a plan node.
    #[must_use]
    pub fn new(id: impl Into<PlanId>, step: PlanStep) -> Self {
        Self {
            id: id.into(),
            attempts: Vec::new(),
            step: Some(step),
        }
    }

    /// Creates a node with no variant.
    #[must_use]
    pub fn empty(id: impl Into<PlanId>) -> Self {
        Self {
            id: id.into(),
            attempts: Vec::new(),
            step: None,
        }
    }

    /// Sets the attempt path.
    #[must_use]
    pub fn with_attempts(mut self, attempts: Vec<u32>) -> Self {
        self.attempts = attempts;
        self
    }

    /// Returns the attempt path joined with dots, e.g. `"2.1"`.
    #[must_use]
    pub fn attempt_path(&self) -> String {
        self.attempts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Calls `f` on this node and every node below it, depth first.
    pub fn each<F: FnMut(&Self)>(&self, f: &mut F) {
        f(self);

        let Some(step) = &self.step else {
            return;
        };

        match step {
            PlanStep::Do(plans) | PlanStep::Retry(plans) => {
                for plan in plans {
                    plan.each(f);
                }
            }
            PlanStep::InParallel(parallel) => {
                for plan in &parallel.steps {
                    plan.each(f);
                }
            }
            PlanStep::Across(across) => {
                for scoped in &across.steps {
                    scoped.step.each(f);
                }
            }
            PlanStep::OnAbort(hook)
            | PlanStep::OnError(hook)
            | PlanStep::OnSuccess(hook)
            | PlanStep::OnFailure(hook)
            | PlanStep::Ensure(hook) => {
                hook.step.each(f);
                hook.next.each(f);
            }
            PlanStep::Timeout(timeout) => timeout.step.each(f),
            PlanStep::Try(attempt) => attempt.step.each(f),
            _ => {}
        }
    }

    /// Counts nodes of the given variant kind in the tree.
    #[must_use]
    pub fn count_kind(&self, kind: &str) -> usize {
        let mut count = 0;
        self.each(&mut |plan| {
            if plan.step.as_ref().is_some_and(|s| s.kind() == kind) {
                count += 1;
            }
        });
        count
    }

    /// The plan as shown to users: structure and names, never sources,
    /// params or vars.
    #[must_use]
    pub fn public(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("id".to_string(), json!(self.id));
        if let Some(step) = &self.step {
            out.insert(step.kind().to_string(), step.public());
        }
        Value::Object(out)
    }
}

impl PlanStep {
    fn public(&self) -> Value {
        fn all(plans: &[Plan]) -> Value {
            Value::Array(plans.iter().map(Plan::public).collect())
        }

        match self {
            Self::Do(plans) | Self::Retry(plans) => all(plans),
            Self::InParallel(p) => json!({
                "steps": all(&p.steps),
                "limit": p.limit,
                "fail_fast": p.fail_fast,
            }),
            Self::Across(a) => json!({
                "vars": a.vars.iter().map(|v| json!({
                    "name": v.var,
                    "values": v.values,
                    "max_in_flight": v.max_in_flight,
                })).collect::<Vec<_>>(),
                "steps": a.steps.iter().map(|s| json!({
                    "step": s.step.public(),
                    "values": s.values,
                })).collect::<Vec<_>>(),
                "fail_fast": a.fail_fast,
            }),
            Self::Timeout(t) => json!({ "step": t.step.public(), "duration": t.duration }),
            Self::Try(t) => json!({ "step": t.step.public() }),
            Self::OnAbort(h)
            | Self::OnError(h)
            | Self::OnSuccess(h)
            | Self::OnFailure(h)
            | Self::Ensure(h) => json!({ "step": h.step.public(), "next": h.next.public() }),
            Self::Run(r) => json!({ "message": r.message, "type": r.prototype }),
            Self::Task(t) => json!({ "name": t.name, "privileged": t.privileged }),
            Self::SetPipeline(s) => json!({
                "name": s.name,
                "team": s.team,
                "instance_vars": s.instance_vars,
            }),
            Self::LoadVar(l) => json!({ "name": l.name }),
            Self::Check(c) => json!({ "name": c.name, "type": c.resource_type }),
            Self::Get(g) => json!({
                "name": g.name,
                "type": g.resource_type,
                "resource": g.resource,
                "version": g.version,
            }),
            Self::Put(p) => json!({
                "name": p.name,
                "type": p.resource_type,
                "resource": p.resource,
            }),
            Self::ArtifactInput(a) => json!({ "artifact_id": a.artifact_id, "name": a.name }),
            Self::ArtifactOutput(a) => json!({ "name": a.name }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn task(id: &str) -> Plan {
        Plan::new(
            id,
            PlanStep::Task(TaskPlan {
                name: id.to_string(),
                ..TaskPlan::default()
            }),
        )
    }

    fn hook(kind: fn(HookPlan) -> PlanStep, id: &str, step: Plan, next: Plan) -> Plan {
        Plan::new(
            id,
            kind(HookPlan {
                step: Box::new(step),
                next: Box::new(next),
            }),
        )
    }

    #[test]
    fn test_child_id() {
        assert_eq!(PlanId::from("42").child("image-check").as_str(), "42/image-check");
    }

    #[test]
    fn test_attempt_path() {
        assert_eq!(task("t").attempt_path(), "");
        assert_eq!(task("t").with_attempts(vec![2, 1]).attempt_path(), "2.1");
    }

    #[test]
    fn test_each_visits_every_node() {
        let plan = hook(
            PlanStep::Ensure,
            "ensure",
            Plan::new(
                "do",
                PlanStep::Do(vec![
                    task("a"),
                    Plan::new("retry", PlanStep::Retry(vec![task("b"), task("c")])),
                ]),
            ),
            task("d"),
        );

        let mut ids = Vec::new();
        plan.each(&mut |p| ids.push(p.id.to_string()));

        assert_eq!(ids, vec!["ensure", "do", "a", "retry", "b", "c", "d"]);
        assert_eq!(plan.count_kind("task"), 4);
        assert_eq!(plan.count_kind("retry"), 1);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::json!({
            "id": "1",
            "step": {
                "on_success": {
                    "step": {"id": "2", "step": {"get": {"name": "repo", "type": "git", "source": {"uri": "x"}}}},
                    "next": {"id": "3", "attempts": [1], "step": {"task": {"name": "unit", "privileged": false}}}
                }
            }
        });

        let plan: Plan = serde_json::from_value(json.clone()).unwrap();
        let Some(PlanStep::OnSuccess(hook)) = &plan.step else {
            panic!("expected on_success");
        };
        assert_eq!(hook.next.attempts, vec![1]);
        assert!(matches!(hook.step.step, Some(PlanStep::Get(_))));
        assert_eq!(serde_json::to_value(&plan).unwrap(), json);
    }

    #[test]
    fn test_public_plan_hides_sources() {
        let plan = Plan::new(
            "img/image-get",
            PlanStep::Get(GetPlan {
                name: "image".to_string(),
                resource_type: "docker".to_string(),
                source: serde_json::from_value(json!({"password": "hunter2"})).unwrap(),
                ..GetPlan::default()
            }),
        );

        let public = plan.public();
        assert_eq!(public["id"], json!("img/image-get"));
        assert_eq!(public["get"]["name"], json!("image"));
        assert!(!public.to_string().contains("hunter2"));
    }

    #[test]
    fn test_empty_plan_has_no_step() {
        let plan: Plan = serde_json::from_value(serde_json::json!({"id": "x"})).unwrap();
        assert!(plan.step.is_none());
        assert_eq!(plan.count_kind("task"), 0);
    }

    #[test]
    fn test_check_interval_parsing() {
        let mut check = CheckPlan::default();
        assert_eq!(check.check_interval().unwrap(), CheckInterval::Default);
        check.interval = "never".to_string();
        assert_eq!(check.check_interval().unwrap(), CheckInterval::Never);
        check.interval = "1m".to_string();
        assert_eq!(
            check.check_interval().unwrap(),
            CheckInterval::Every(std::time::Duration::from_secs(60))
        );
        check.interval = "soon".to_string();
        assert!(check.check_interval().is_err());
    }

    #[test]
    fn test_periodic_checks() {
        let mut check = CheckPlan::default();
        assert!(!check.is_periodic());
        check.resource = "repo".to_string();
        assert!(check.is_periodic());
        check.resource.clear();
        check.resource_type_name = "custom".to_string();
        assert!(check.is_periodic());
    }

    #[test]
    fn test_leaf_kinds() {
        assert!(task("t").step.unwrap().is_leaf());
        assert!(!PlanStep::Do(vec![]).is_leaf());
        assert!(!PlanStep::Retry(vec![]).is_leaf());
    }
}
