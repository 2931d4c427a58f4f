//! Reference plugin worker.
//!
//! Started by a host with `PLUGIN_WORKER_SOCKET` set. Its behaviour comes
//! entirely from the plugin options:
//!
//! ```json
//! {
//!   "name": "demo",
//!   "createNodesPattern": "**/project.json",
//!   "dependencies": [{ "source": "a", "target": "b" }],
//!   "processProjectGraph": true,
//!   "failLoad": "cannot resolve plugin",
//!   "crashOn": "createDependencies",
//!   "exitCode": 1,
//!   "delayMillis": 50
//! }
//! ```
//!
//! `crashOn` accepts `load` or any operation name.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugin_workers::config::LoggingSettings;
use plugin_workers::serve::{self, PluginLoader, WorkerPlugin};
use plugin_workers::telemetry;
use plugin_workers::worker::protocol::PluginCapabilities;
use plugin_workers::worker::{PluginConfiguration, RawDependency, RemoteError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DemoOptions {
    name: Option<String>,
    create_nodes_pattern: Option<String>,
    dependencies: Option<Vec<RawDependency>>,
    process_project_graph: bool,
    fail_load: Option<String>,
    crash_on: Option<String>,
    exit_code: Option<i32>,
    delay_millis: u64,
}

struct DemoPlugin {
    options: DemoOptions,
}

impl DemoPlugin {
    async fn enter(&self, operation: &str) {
        if self.options.delay_millis > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.delay_millis)).await;
        }
        crash_if(&self.options, operation);
    }
}

fn crash_if(options: &DemoOptions, operation: &str) {
    if options.crash_on.as_deref() == Some(operation) {
        let code = options.exit_code.unwrap_or(1);
        info!(operation, code, "crashing on request");
        std::process::exit(code);
    }
}

#[async_trait]
impl WorkerPlugin for DemoPlugin {
    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            name: self
                .options
                .name
                .clone()
                .unwrap_or_else(|| "demo".to_string()),
            create_nodes_pattern: self.options.create_nodes_pattern.clone(),
            has_create_dependencies: self.options.dependencies.is_some(),
            has_process_project_graph: self.options.process_project_graph,
        }
    }

    async fn create_nodes(
        &self,
        config_files: Vec<String>,
        _context: Value,
    ) -> Result<Value, RemoteError> {
        self.enter("createNodes").await;
        let entries: Vec<Value> = config_files
            .into_iter()
            .map(|file| {
                let dir = Path::new(&file)
                    .parent()
                    .map(|dir| dir.to_string_lossy().into_owned())
                    .unwrap_or_default();
                json!([file, { "projects": { dir.clone(): { "root": dir } } }])
            })
            .collect();
        Ok(Value::Array(entries))
    }

    async fn create_dependencies(
        &self,
        _options: Value,
        _context: Value,
    ) -> Result<Vec<RawDependency>, RemoteError> {
        self.enter("createDependencies").await;
        Ok(self.options.dependencies.clone().unwrap_or_default())
    }

    async fn process_project_graph(
        &self,
        graph: Value,
        _context: Value,
    ) -> Result<Value, RemoteError> {
        self.enter("processProjectGraph").await;
        Ok(graph)
    }
}

struct DemoLoader;

#[async_trait]
impl PluginLoader for DemoLoader {
    async fn load(
        &self,
        configuration: &PluginConfiguration,
        _root: &Path,
    ) -> Result<Arc<dyn WorkerPlugin>, RemoteError> {
        let options: DemoOptions = match &configuration.options {
            Some(options) => serde_json::from_value(options.clone())
                .map_err(|err| RemoteError::new(format!("invalid demo options: {err}")))?,
            None => DemoOptions::default(),
        };
        crash_if(&options, "load");
        if let Some(message) = &options.fail_load {
            return Err(RemoteError {
                name: Some("LoadError".to_string()),
                message: message.clone(),
                stack: None,
            });
        }
        Ok(Arc::new(DemoPlugin { options }))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = telemetry::initialise(&LoggingSettings::default()) {
        eprintln!("demo-plugin-worker: {}", e);
    }

    match serve::serve_from_env(DemoLoader).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("demo-plugin-worker: {}", e);
            ExitCode::FAILURE
        }
    }
}
