//! Plugin workers CLI - Load plugins out of process and query them
//!
//! Usage:
//!   plugin-workers inspect
//!   plugin-workers create-nodes <files...>
//!   plugin-workers create-dependencies [--options <json>]
//!
//! Examples:
//!   plugin-workers --config plugin-workers.toml inspect
//!   plugin-workers --root ../monorepo create-nodes apps/web/project.json
//!   plugin-workers create-dependencies --options '{"strict":true}'

use clap::{Parser, Subcommand};
use plugin_workers::config::Settings;
use plugin_workers::telemetry;
use plugin_workers::worker::{PluginWorkerPool, RemotePlugin, WorkerResult};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "plugin-workers")]
#[command(about = "Run workspace plugins in isolated worker processes")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the usual search locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root handed to every plugin
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Plugin-host program, overriding the settings file
    #[arg(long, global = true)]
    program: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every configured plugin and list what it provides
    Inspect,

    /// Run createNodes on every plugin that implements it
    CreateNodes {
        /// Config files to offer the plugins
        files: Vec<String>,
    },

    /// Run createDependencies on every plugin that implements it
    CreateDependencies {
        /// Options passed to each plugin, as JSON
        #[arg(short, long, default_value = "{}")]
        options: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let mut settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(program) = cli.program {
        settings.worker.program = Some(program);
    }

    if let Err(e) = telemetry::initialise(&settings.logging) {
        eprintln!("Error configuring logging: {}", e);
        return ExitCode::FAILURE;
    }

    if settings.plugins.is_empty() {
        eprintln!("No plugins configured");
        return ExitCode::FAILURE;
    }

    let pool = PluginWorkerPool::new(&settings.worker);

    let code = tokio::select! {
        code = run(&pool, &settings, &cli.root, cli.command) => code,
        _ = tokio::signal::ctrl_c() => {
            let stopped = pool.cleanup_registry().run_all();
            eprintln!("Interrupted, stopped {} plugin worker(s)", stopped);
            return ExitCode::from(130);
        }
    };

    pool.shutdown_all().await;
    code
}

async fn run(
    pool: &PluginWorkerPool,
    settings: &Settings,
    root: &std::path::Path,
    command: Commands,
) -> ExitCode {
    let root = match root.canonicalize() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Error resolving root '{}': {}", root.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut plugins = Vec::new();
    let mut failed = false;
    for (configuration, loaded) in settings
        .plugins
        .iter()
        .zip(pool.load_plugins(&settings.plugins, &root).await)
    {
        match loaded {
            Ok(plugin) => plugins.push(plugin),
            Err(e) => {
                eprintln!("Failed to load '{}': {}", configuration.plugin, e);
                failed = true;
            }
        }
    }

    let output = match command {
        Commands::Inspect => Ok(inspect(&plugins)),
        Commands::CreateNodes { files } => create_nodes(&plugins, &files, &root).await,
        Commands::CreateDependencies { options } => {
            let options: Value = match serde_json::from_str(&options) {
                Ok(options) => options,
                Err(e) => {
                    eprintln!("Invalid --options JSON: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            create_dependencies(&plugins, options, &root).await
        }
    };

    match output {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error formatting output: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            eprintln!("Plugin error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn inspect(plugins: &[RemotePlugin]) -> Value {
    plugins
        .iter()
        .map(|plugin| {
            json!({
                "name": plugin.name(),
                "createNodes": plugin.create_nodes().map(|op| op.pattern()),
                "createDependencies": plugin.create_dependencies().is_some(),
                "processProjectGraph": plugin.process_project_graph().is_some(),
            })
        })
        .collect()
}

fn context(root: &std::path::Path) -> Value {
    json!({ "workspaceRoot": root })
}

async fn create_nodes(
    plugins: &[RemotePlugin],
    files: &[String],
    root: &std::path::Path,
) -> WorkerResult<Value> {
    let mut results = serde_json::Map::new();
    for plugin in plugins {
        if let Some(op) = plugin.create_nodes() {
            let nodes = op.call(files.to_vec(), context(root)).await?;
            results.insert(plugin.name().to_string(), nodes);
        }
    }
    Ok(Value::Object(results))
}

async fn create_dependencies(
    plugins: &[RemotePlugin],
    options: Value,
    root: &std::path::Path,
) -> WorkerResult<Value> {
    let mut dependencies = Vec::new();
    for plugin in plugins {
        if let Some(op) = plugin.create_dependencies() {
            dependencies.extend(op.call(options.clone(), context(root)).await?);
        }
    }
    Ok(json!(dependencies))
}
