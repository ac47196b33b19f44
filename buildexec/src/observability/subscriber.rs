//! Process-wide tracing setup.

use crate::config::LogConfig;
use crate::errors::{ExecError, Result};
use tracing_subscriber::EnvFilter;

/// Builds the filter for `config`: `RUST_LOG` when set, else the configured
/// directive.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|err| ExecError::Config(format!("log filter {:?}: {err}", config.filter))),
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config)?);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| ExecError::Config(format!("installing tracing subscriber: {err}")))
}
