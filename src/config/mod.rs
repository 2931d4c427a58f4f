//! Configuration module for plugin workers.
//!
//! Handles the settings file, environment variable expansion, and worker
//! launch options.

mod settings;

pub use settings::{expand_env_vars, LoggingSettings, Settings, SettingsError, WorkerSettings};
