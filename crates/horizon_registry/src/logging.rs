//! Logging system setup.
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Installs the global tracing subscriber.
///
/// # Arguments
/// * `settings` - Level and output format from the configuration file
/// * `force_json` - Overrides `settings.json_format` when set from the command line
///
/// # Returns
/// * `Result<()>` - Fails if a global subscriber is already installed
pub fn setup_logging(settings: &LoggingSettings, force_json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if force_json || settings.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
    };

    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
