//! Metrics emission and tracing setup.

mod metrics;
mod subscriber;

pub use metrics::{
    BuildLabels, CollectingMetricsEmitter, LoggingMetricsEmitter, MetricEvent, MetricsEmitter,
    NoOpMetricsEmitter,
};
pub use subscriber::{env_filter, init_tracing};
