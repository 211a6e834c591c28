//! Tracing subscriber bootstrap.
//!
//! Library code only emits `tracing` events; binaries and tests that want to
//! see them call [`init_tracing`] once at startup.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Whether console output is installed at all.
    #[serde(default = "default_console_output")]
    pub console_output: bool,

    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_console_output() -> bool {
    true
}

fn default_filter() -> String {
    "info,resque_jobs=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            console_output: default_console_output(),
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber was already installed.
pub fn init_tracing(config: &TelemetryConfig) -> CoreResult<()> {
    if !config.console_output {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };

    result.map_err(|e| CoreError::Telemetry(e.to_string()))?;

    tracing::info!(format = ?config.format, filter = %config.filter, "Tracing initialized");

    Ok(())
}
