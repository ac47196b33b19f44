//! Payload types for each plan variant.

use super::{Plan, PlanId};
use crate::errors::Result;
use crate::utils::parse_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A resource version: an ordered string map.
pub type Version = BTreeMap<String, String>;

/// Resource source configuration. Values may contain `((var))` placeholders.
pub type Source = serde_json::Map<String, serde_json::Value>;

/// Parameters passed to a resource or task.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Worker tags used for placement.
pub type Tags = Vec<String>;

/// A step and the hook that runs after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPlan {
    /// The step being decorated.
    pub step: Box<Plan>,
    /// The hook.
    pub next: Box<Plan>,
}

/// Wraps a step with a deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPlan {
    /// The step being limited.
    pub step: Box<Plan>,
    /// Go-style duration string, e.g. `"1h30m"`.
    pub duration: String,
}

/// Runs a step on a best-effort basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryPlan {
    /// The step being tried.
    pub step: Box<Plan>,
}

/// Runs steps concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InParallelPlan {
    /// The steps.
    pub steps: Vec<Plan>,
    /// Maximum number of steps running at once; 0 means unbounded.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: usize,
    /// Cancel the remaining steps after the first failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_fast: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// How many values of an across var may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MaxInFlight {
    /// Run every value at once.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
    /// Run at most this many values at once.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: usize,
}

impl MaxInFlight {
    /// Returns the concurrency limit for `total` values.
    #[must_use]
    pub fn effective(self, total: usize) -> usize {
        if self.all {
            total.max(1)
        } else {
            self.limit.max(1)
        }
    }
}

/// A variable iterated by an across step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcrossVar {
    /// Variable name.
    #[serde(rename = "name")]
    pub var: String,
    /// Values to iterate over.
    pub values: Vec<serde_json::Value>,
    /// Concurrency for this var; one at a time when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<MaxInFlight>,
}

/// One combination of across var values and the plan to run for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarScopedPlan {
    /// The substep.
    pub step: Plan,
    /// One value per across var, in var order.
    pub values: Vec<serde_json::Value>,
}

/// Runs a substep for every combination of var values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AcrossPlan {
    /// The vars, outermost first.
    pub vars: Vec<AcrossVar>,
    /// Substeps in row-major order of the var value combinations.
    pub steps: Vec<VarScopedPlan>,
    /// Stop starting combinations after the first failure.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fail_fast: bool,
}

/// Where a step's container image comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageResource {
    /// Optional name used for the synthesized sub-plans.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Resource type, e.g. `registry-image`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source.
    #[serde(default)]
    pub source: Source,
    /// Get params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Pinned version; skips the check when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Worker tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Tags,
}

/// A custom resource type available to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceTypeConfig {
    /// Type name.
    pub name: String,
    /// The type this type is implemented by.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Source for fetching the type's image.
    #[serde(default)]
    pub source: Source,
    /// Whether containers of this type run privileged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    /// The version of the type to use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Fetches a version of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GetPlan {
    /// Step name.
    #[serde(default)]
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source.
    #[serde(default)]
    pub source: Source,
    /// Params for the get.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Version to fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Take the version from another plan's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<PlanId>,
    /// Pipeline resource to annotate.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Custom resource types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceTypeConfig>,
    /// Worker tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Tags,
    /// Timeout for the get process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Whether the resource type is privileged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

/// Pushes to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PutPlan {
    /// Step name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source.
    #[serde(default)]
    pub source: Source,
    /// Params for the put.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Artifacts to pass in; all of them when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    /// Pipeline resource to save versions onto.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Custom resource types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceTypeConfig>,
    /// Worker tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Tags,
    /// Timeout for the put process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Expose `BUILD_CREATED_BY` to the put.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expose_build_created_by: bool,
    /// Whether the resource type is privileged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

/// How often a periodic check may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInterval {
    /// Use the configured default.
    Default,
    /// Never check periodically.
    Never,
    /// Check at most this often.
    Every(Duration),
}

/// Checks a resource for new versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckPlan {
    /// Step name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source.
    #[serde(default)]
    pub source: Source,
    /// Version to check from; the latest known version when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    /// Pipeline resource owning the checked config.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Pipeline resource type owning the checked config.
    #[serde(rename = "resource_type", default, skip_serializing_if = "String::is_empty")]
    pub resource_type_name: String,
    /// Custom resource types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceTypeConfig>,
    /// Check interval: a duration, `never`, or empty for the default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    /// Timeout for the check process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Worker tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Tags,
    /// Whether the resource type is privileged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

impl CheckPlan {
    /// A periodic check belongs to a pipeline resource or resource type and
    /// is scheduled on an interval.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        !self.resource.is_empty() || !self.resource_type_name.is_empty()
    }

    /// Parses the interval string.
    pub fn check_interval(&self) -> Result<CheckInterval> {
        match self.interval.trim() {
            "" => Ok(CheckInterval::Default),
            "never" => Ok(CheckInterval::Never),
            other => parse_duration(other).map(CheckInterval::Every),
        }
    }
}

/// The command a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskRunConfig {
    /// Executable path.
    pub path: String,
    /// Arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    /// User to run as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

/// A resolved task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskConfig {
    /// Target platform.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    /// Image to run in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource: Option<ImageResource>,
    /// Command to run.
    #[serde(default)]
    pub run: TaskRunConfig,
    /// Environment parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Input artifact names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Output artifact names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

/// Runs a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskPlan {
    /// Step name.
    pub name: String,
    /// Run privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Worker tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Tags,
    /// Path to a config file inside an artifact.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_path: String,
    /// Inline config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// Artifact to use as the image.
    #[serde(rename = "image", default, skip_serializing_if = "String::is_empty")]
    pub image_artifact_name: String,
    /// Vars for the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Params>,
    /// Environment parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Input renames.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Output renames.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// Timeout for the task process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Custom resource types for fetching the image.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceTypeConfig>,
}

/// Runs a prototype message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunPlan {
    /// Message to send to the prototype.
    pub message: String,
    /// Prototype type.
    #[serde(rename = "type")]
    pub prototype: String,
    /// Message params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Run privileged.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
}

/// Configures a pipeline from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SetPipelinePlan {
    /// Pipeline name.
    pub name: String,
    /// Config file path.
    pub file: String,
    /// Target team; the build's team when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub team: String,
    /// Static vars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Params>,
    /// Var files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub var_files: Vec<String>,
    /// Instance vars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_vars: Option<Params>,
}

/// Loads a file into a local var.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoadVarPlan {
    /// Var name.
    pub name: String,
    /// File path.
    pub file: String,
    /// `json`, `yaml`, `yml`, `trim` or `raw`; guessed from the extension when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    /// Show the value in build output instead of redacting it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reveal: bool,
}

/// Imports an uploaded artifact (one-off builds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactInputPlan {
    /// Stored artifact ID.
    pub artifact_id: i64,
    /// Name to register it under.
    pub name: String,
}

/// Exports an artifact for download (one-off builds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactOutputPlan {
    /// Artifact name.
    pub name: String,
}
