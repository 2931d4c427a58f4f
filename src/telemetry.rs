//! Structured logging for hosts and workers.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Handle returned when telemetry has been initialised.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors encountered while configuring telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("failed to install telemetry subscriber: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Install the global subscriber on first use.
///
/// `RUST_LOG` wins over the configured filter. Later calls return a handle
/// without touching the global state.
pub fn initialise(settings: &LoggingSettings) -> Result<TelemetryHandle, TelemetryError> {
    TELEMETRY_GUARD
        .get_or_try_init(|| install_subscriber(&filter_directive(settings)))
        .map(|_| TelemetryHandle)
}

fn filter_directive(settings: &LoggingSettings) -> String {
    std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| settings.filter.clone())
}

fn install_subscriber(directive: &str) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_new(directive).map_err(|error| TelemetryError::Filter(error.to_string()))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(io::stderr)
        // Worker stdout is shared with the host terminal; keep logs on stderr.
        .with_ansi(io::stderr().is_terminal())
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
}
