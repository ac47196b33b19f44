//! Metadata derived from a build for each compiled leaf step.

use crate::db::Build;
use crate::plan::Params;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::fmt::Write as _;

/// Root under which step working directories live.
const BUILD_ROOT: &str = "/tmp/build";

/// Identity of the build a step belongs to, exposed to its process as env vars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Build ID.
    pub build_id: i64,
    /// Build name.
    pub build_name: String,
    /// Team ID.
    pub team_id: i64,
    /// Team name.
    pub team_name: String,
    /// Job ID.
    pub job_id: i64,
    /// Job name.
    pub job_name: String,
    /// Pipeline ID.
    pub pipeline_id: i64,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Pipeline instance vars.
    pub pipeline_instance_vars: Option<Params>,
    /// Externally reachable URL of the server.
    pub external_url: String,
    /// Creator of the build; only set when the step asks for it.
    pub created_by: String,
}

impl StepMetadata {
    /// Derives metadata from a build.
    #[must_use]
    pub fn for_build(build: &dyn Build, external_url: &str, expose_created_by: bool) -> Self {
        Self {
            build_id: build.id(),
            build_name: build.name(),
            team_id: build.team_id(),
            team_name: build.team_name(),
            job_id: build.job_id(),
            job_name: build.job_name(),
            pipeline_id: build.pipeline_id(),
            pipeline_name: build.pipeline_name(),
            pipeline_instance_vars: build.pipeline_instance_vars(),
            external_url: external_url.to_string(),
            created_by: if expose_created_by {
                build.created_by().unwrap_or_default()
            } else {
                String::new()
            },
        }
    }

    /// Returns `KEY=value` pairs, skipping any whose source is empty.
    #[must_use]
    pub fn env(&self) -> Vec<String> {
        let mut env = Vec::new();

        if self.build_id != 0 {
            env.push(format!("BUILD_ID={}", self.build_id));
        }
        if !self.build_name.is_empty() {
            env.push(format!("BUILD_NAME={}", self.build_name));
        }
        if self.team_id != 0 {
            env.push(format!("BUILD_TEAM_ID={}", self.team_id));
        }
        if !self.team_name.is_empty() {
            env.push(format!("BUILD_TEAM_NAME={}", self.team_name));
        }
        if self.pipeline_id != 0 {
            env.push(format!("BUILD_PIPELINE_ID={}", self.pipeline_id));
        }
        if !self.pipeline_name.is_empty() {
            env.push(format!("BUILD_PIPELINE_NAME={}", self.pipeline_name));
        }
        if let Some(vars) = self.instance_vars_json() {
            env.push(format!("BUILD_PIPELINE_INSTANCE_VARS={vars}"));
        }
        if self.job_id != 0 {
            env.push(format!("BUILD_JOB_ID={}", self.job_id));
        }
        if !self.job_name.is_empty() {
            env.push(format!("BUILD_JOB_NAME={}", self.job_name));
        }
        if !self.created_by.is_empty() {
            env.push(format!("BUILD_CREATED_BY={}", self.created_by));
        }
        if !self.external_url.is_empty() {
            env.push(format!("ATC_EXTERNAL_URL={}", self.external_url));
            env.push(format!("BUILD_URL={}", self.build_url()));
            env.push(format!("BUILD_URL_SHORT={}", self.short_build_url()));
        }

        env
    }

    /// URL of the build page: the job build page for job builds, the one-off
    /// build page otherwise.
    #[must_use]
    pub fn build_url(&self) -> String {
        if self.job_name.is_empty() {
            return self.short_build_url();
        }

        let mut url = format!(
            "{}/teams/{}/pipelines/{}/jobs/{}/builds/{}",
            self.external_url,
            escape(&self.team_name),
            escape(&self.pipeline_name),
            escape(&self.job_name),
            escape(&self.build_name),
        );
        if let Some(vars) = self.instance_vars_json() {
            let _ = write!(url, "?vars={}", escape(&vars));
        }
        url
    }

    /// Short URL of the build page.
    #[must_use]
    pub fn short_build_url(&self) -> String {
        format!("{}/builds/{}", self.external_url, self.build_id)
    }

    fn instance_vars_json(&self) -> Option<String> {
        self.pipeline_instance_vars
            .as_ref()
            .filter(|vars| !vars.is_empty())
            .and_then(|vars| serde_json::to_string(vars).ok())
    }
}

/// Percent-encodes everything outside the URL-unreserved set.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

/// Kind of container a step runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// Resource check.
    Check,
    /// Resource get.
    Get,
    /// Resource put.
    Put,
    /// Task.
    Task,
    /// Prototype run.
    Run,
}

impl ContainerType {
    /// Returns the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Get => "get",
            Self::Put => "put",
            Self::Task => "task",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels attached to the container a leaf step runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Container kind.
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    /// Step name.
    pub step_name: String,
    /// Dot-joined attempt path, e.g. `"2.1"`.
    pub attempt: String,
    /// Working directory inside the container.
    pub working_directory: String,
    /// Pipeline ID.
    pub pipeline_id: i64,
    /// Job ID.
    pub job_id: i64,
    /// Build ID.
    pub build_id: i64,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Pipeline instance vars as JSON, empty when there are none.
    pub pipeline_instance_vars: String,
    /// Job name.
    pub job_name: String,
    /// Build name.
    pub build_name: String,
    /// User the process runs as.
    pub user: String,
}

impl ContainerMetadata {
    /// Derives container metadata for a leaf step.
    #[must_use]
    pub fn for_step(
        build: &dyn Build,
        container_type: ContainerType,
        step_name: &str,
        attempts: &[u32],
    ) -> Self {
        let attempt = attempts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");

        let pipeline_instance_vars = build
            .pipeline_instance_vars()
            .and_then(|vars| serde_json::to_string(&vars).ok())
            .unwrap_or_default();

        Self {
            container_type,
            step_name: step_name.to_string(),
            attempt,
            working_directory: working_directory(container_type, step_name),
            pipeline_id: build.pipeline_id(),
            job_id: build.job_id(),
            build_id: build.id(),
            pipeline_name: build.pipeline_name(),
            pipeline_instance_vars,
            job_name: build.job_name(),
            build_name: build.name(),
            user: String::new(),
        }
    }
}

/// Working directory for a step. Tasks get a directory named after the first
/// four bytes of the SHA-1 of their name, so the same step always lands in
/// the same place.
#[must_use]
pub fn working_directory(container_type: ContainerType, step_name: &str) -> String {
    match container_type {
        ContainerType::Task => {
            let digest = Sha1::digest(step_name.as_bytes());
            format!("{BUILD_ROOT}/{}", hex::encode(&digest[..4]))
        }
        ContainerType::Get | ContainerType::Put => format!("{BUILD_ROOT}/{container_type}"),
        ContainerType::Check | ContainerType::Run => String::new(),
    }
}
