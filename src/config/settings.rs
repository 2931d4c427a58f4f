//! TOML-based configuration for plugin workers.
//!
//! Supports a config file (plugin-workers.toml) with environment variable
//! expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! program = "${PLUGIN_HOST_BIN}"
//! args = ["--experimental"]
//! call_timeout_secs = 120
//!
//! [worker.env]
//! NODE_OPTIONS = "--max-old-space-size=4096"
//!
//! [logging]
//! filter = "plugin_workers=debug"
//!
//! [[plugins]]
//! plugin = "@acme/graph-plugin"
//! options = { target = "build" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::worker::protocol::PluginConfiguration;
use crate::worker::SupervisorOptions;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// How workers are started.
    pub worker: WorkerSettings,

    /// Log output.
    pub logging: LoggingSettings,

    /// Plugins to load.
    pub plugins: Vec<PluginConfiguration>,
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Plugin-host program run once per worker (supports ${ENV_VAR}).
    pub program: Option<String>,

    /// Extra arguments for the program.
    pub args: Vec<String>,

    /// Extra environment for the worker (values support ${ENV_VAR}).
    pub env: HashMap<String, String>,

    /// Variable through which the worker learns the project-wide config file.
    pub project_config_env: Option<String>,

    /// Candidate project config files, relative to the workspace root, first
    /// match wins.
    pub project_config_files: Vec<String>,

    /// Seconds to wait for a spawned worker to connect.
    pub connect_timeout_secs: u64,

    /// Upper bound for a single plugin call. Unset means no limit.
    pub call_timeout_secs: Option<u64>,

    /// Milliseconds to keep reading replies after a worker exits.
    pub exit_drain_millis: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: HashMap::new(),
            project_config_env: Some("PLUGIN_WORKER_PROJECT_CONFIG".to_string()),
            project_config_files: vec![
                "tsconfig.base.json".to_string(),
                "tsconfig.json".to_string(),
            ],
            connect_timeout_secs: 30,
            call_timeout_secs: None,
            exit_drain_millis: 100,
        }
    }
}

impl WorkerSettings {
    /// Settings for a specific plugin-host program.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Get the worker program with environment variables expanded.
    pub fn resolved_program(&self) -> Result<PathBuf, SettingsError> {
        let program = self
            .program
            .as_deref()
            .ok_or_else(|| SettingsError::InvalidConfig("worker.program is not set".to_string()))?;
        Ok(PathBuf::from(expand_env_vars(program)?))
    }

    /// Get the extra environment with values expanded.
    pub fn resolved_env(&self) -> Result<Vec<(String, String)>, SettingsError> {
        self.env
            .iter()
            .map(|(key, value)| Ok((key.clone(), expand_env_vars(value)?)))
            .collect()
    }

    /// The project config variable and the first candidate file that exists
    /// under `root`.
    pub fn project_config(&self, root: &Path) -> Option<(String, PathBuf)> {
        let var = self.project_config_env.as_ref()?;
        self.project_config_files
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file())
            .map(|path| (var.clone(), path))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Supervisor tunables derived from these settings.
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            call_timeout: self.call_timeout_secs.map(Duration::from_secs),
            exit_drain: Duration::from_millis(self.exit_drain_millis),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "warn,plugin_workers=info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `PLUGIN_WORKERS_CONFIG`
    /// 2. `./plugin-workers.toml`
    /// 3. `~/.config/plugin-workers/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("PLUGIN_WORKERS_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("plugin-workers.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("plugin-workers").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Return defaults if no config file found
        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            chars.by_ref().take_while(|&ch| ch != '}').collect()
        } else {
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
