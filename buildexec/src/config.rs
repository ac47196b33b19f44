//! Engine configuration.
//!
//! Durations are written as duration strings (`"1m"`, `"1h30m"`, `"500ms"`).

use crate::errors::Result;
use crate::utils::duration::serde_duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by the engine and the delegates it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lease of the per-build tracking lock.
    #[serde(with = "serde_duration", default = "default_tracking_lock_lease")]
    pub tracking_lock_lease: Duration,
    /// Pause between attempts to take a resource checking lock.
    #[serde(with = "serde_duration", default = "default_check_lock_retry_interval")]
    pub check_lock_retry_interval: Duration,
    /// Interval of periodic checks that do not configure one.
    #[serde(with = "serde_duration", default = "default_check_interval")]
    pub default_check_interval: Duration,
    /// Longest time redacted output is held without a line break.
    #[serde(with = "serde_duration", default = "default_log_flush_interval")]
    pub log_flush_interval: Duration,
    /// Rerun a build whose worker disappeared instead of erroring it.
    #[serde(default)]
    pub rerun_on_worker_disappeared: bool,
    /// Redact credentials from build output.
    #[serde(default = "default_true")]
    pub enable_redaction: bool,
    /// Base URL of the web UI, used for `BUILD_URL`.
    #[serde(default)]
    pub external_url: String,
    /// Cluster name reported to steps.
    #[serde(default)]
    pub cluster_name: String,
    /// Cluster version reported to steps.
    #[serde(default)]
    pub cluster_version: String,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_tracking_lock_lease() -> Duration {
    crate::engine::TRACKING_LOCK_LEASE
}

fn default_check_lock_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_log_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracking_lock_lease: default_tracking_lock_lease(),
            check_lock_retry_interval: default_check_lock_retry_interval(),
            default_check_interval: default_check_interval(),
            log_flush_interval: default_log_flush_interval(),
            rerun_on_worker_disappeared: false,
            enable_redaction: true,
            external_url: String::new(),
            cluster_name: String::new(),
            cluster_version: String::new(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Sets the tracking lock lease.
    #[must_use]
    pub fn with_tracking_lock_lease(mut self, lease: Duration) -> Self {
        self.tracking_lock_lease = lease;
        self
    }

    /// Sets the default check interval.
    #[must_use]
    pub fn with_default_check_interval(mut self, interval: Duration) -> Self {
        self.default_check_interval = interval;
        self
    }

    /// Sets the pause between checking lock attempts.
    #[must_use]
    pub fn with_check_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.check_lock_retry_interval = interval;
        self
    }

    /// Enables rerunning builds that lost their worker.
    #[must_use]
    pub fn with_rerun_on_worker_disappeared(mut self, enabled: bool) -> Self {
        self.rerun_on_worker_disappeared = enabled;
        self
    }

    /// Enables or disables credential redaction.
    #[must_use]
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.enable_redaction = enabled;
        self
    }

    /// Sets the external URL.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tracking_lock_lease, Duration::from_secs(60));
        assert_eq!(config.check_lock_retry_interval, Duration::from_secs(1));
        assert!(config.enable_redaction);
        assert!(!config.rerun_on_worker_disappeared);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "tracking_lock_lease": "1h30m",
                "default_check_interval": "500ms",
                "rerun_on_worker_disappeared": true,
                "external_url": "https://ci.example.com",
                "log": {"json": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.tracking_lock_lease, Duration::from_secs(5400));
        assert_eq!(config.default_check_interval, Duration::from_millis(500));
        assert!(config.rerun_on_worker_disappeared);
        assert_eq!(config.external_url, "https://ci.example.com");
        assert!(config.log.json);
        assert_eq!(config.log.filter, "info");
        assert_eq!(config.log_flush_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"tracking_lock_lease": "soon"}"#).is_err());
    }

    #[test]
    fn test_serialization_round_trips() {
        let config = EngineConfig::default().with_external_url("https://ci");
        let raw = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&raw).unwrap(), config);
    }
}
