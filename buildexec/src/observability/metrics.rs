//! Build lifecycle metrics.

use crate::core::BuildStatus;
use crate::db::Build;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, Level};

/// Names identifying the build a metric is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLabels {
    /// Build ID.
    pub build_id: i64,
    /// Build name.
    pub build_name: String,
    /// Team name.
    pub team_name: String,
    /// Pipeline name, empty for one-off builds.
    pub pipeline_name: String,
    /// Job name, empty for one-off builds.
    pub job_name: String,
}

impl BuildLabels {
    /// Reads the labels off a build.
    #[must_use]
    pub fn for_build(build: &dyn Build) -> Self {
        Self {
            build_id: build.id(),
            build_name: build.name(),
            team_name: build.team_name(),
            pipeline_name: build.pipeline_name(),
            job_name: build.job_name(),
        }
    }
}

/// A build lifecycle measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MetricEvent {
    /// An engine started running the build.
    BuildStarted {
        /// Build identity.
        #[serde(flatten)]
        labels: BuildLabels,
    },
    /// The build reached a terminal status.
    BuildFinished {
        /// Build identity.
        #[serde(flatten)]
        labels: BuildLabels,
        /// Final status.
        status: BuildStatus,
        /// Time from start to end, zero if either is unknown.
        duration: Duration,
    },
}

impl MetricEvent {
    /// The metric name, e.g. `"build.finished"`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BuildStarted { .. } => "build.started",
            Self::BuildFinished { .. } => "build.finished",
        }
    }

    /// Build identity the metric carries.
    #[must_use]
    pub const fn labels(&self) -> &BuildLabels {
        match self {
            Self::BuildStarted { labels } | Self::BuildFinished { labels, .. } => labels,
        }
    }

    /// A `BuildFinished` for a reloaded build, measured from its recorded
    /// start and end times.
    #[must_use]
    pub fn finished(build: &dyn Build) -> Self {
        let duration = match (build.start_time(), build.end_time()) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };

        Self::BuildFinished {
            labels: BuildLabels::for_build(build),
            status: build.status(),
            duration,
        }
    }
}

/// Receives metrics. Emission never fails and never blocks.
pub trait MetricsEmitter: Send + Sync {
    /// Records a metric.
    fn emit(&self, event: MetricEvent);
}

/// Discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsEmitter;

impl MetricsEmitter for NoOpMetricsEmitter {
    fn emit(&self, _event: MetricEvent) {}
}

/// Writes metrics to the log.
#[derive(Debug, Clone)]
pub struct LoggingMetricsEmitter {
    level: Level,
}

impl Default for LoggingMetricsEmitter {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingMetricsEmitter {
    /// Creates an emitter logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl MetricsEmitter for LoggingMetricsEmitter {
    fn emit(&self, event: MetricEvent) {
        let labels = event.labels();
        let (status, duration_ms) = match &event {
            MetricEvent::BuildStarted { .. } => (None, None),
            MetricEvent::BuildFinished {
                status, duration, ..
            } => (Some(status.as_str()), Some(duration.as_millis())),
        };

        if self.level == Level::DEBUG {
            debug!(
                metric = event.name(),
                build_id = labels.build_id,
                build_name = %labels.build_name,
                team = %labels.team_name,
                pipeline = %labels.pipeline_name,
                job = %labels.job_name,
                status,
                duration_ms,
                "metric"
            );
        } else {
            info!(
                metric = event.name(),
                build_id = labels.build_id,
                build_name = %labels.build_name,
                team = %labels.team_name,
                pipeline = %labels.pipeline_name,
                job = %labels.job_name,
                status,
                duration_ms,
                "metric"
            );
        }
    }
}

/// Keeps every metric in memory.
#[derive(Debug, Default)]
pub struct CollectingMetricsEmitter {
    events: parking_lot::RwLock<Vec<MetricEvent>>,
}

impl CollectingMetricsEmitter {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every metric so far.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.read().clone()
    }

    /// Metrics named `name`.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<MetricEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }
}

impl MetricsEmitter for CollectingMetricsEmitter {
    fn emit(&self, event: MetricEvent) {
        self.events.write().push(event);
    }
}
