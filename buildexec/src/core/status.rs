//! Build status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a build as recorded by the persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Build has been created but no engine has started it.
    #[default]
    Pending,
    /// An engine has started running the build.
    Started,
    /// Every step succeeded.
    Succeeded,
    /// A step ran to completion without succeeding.
    Failed,
    /// A step returned an error.
    Errored,
    /// The build was cancelled.
    Aborted,
}

impl BuildStatus {
    /// Returns true for the four statuses a build can finish in.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Aborted
        )
    }

    /// Returns the lowercase name used in events and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Started.is_terminal());
        assert!(BuildStatus::Succeeded.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Errored.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&BuildStatus::Aborted).unwrap();
        assert_eq!(json, "\"aborted\"");
        let status: BuildStatus = serde_json::from_str("\"errored\"").unwrap();
        assert_eq!(status, BuildStatus::Errored);
    }
}
