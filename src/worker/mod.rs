//! Plugin worker processes.
//!
//! Each loaded plugin runs in its own worker process. The host talks to it
//! over a dedicated channel using newline-delimited JSON envelopes, and every
//! call is correlated by a transaction id so replies may arrive in any order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Host (Rust + Tokio)                      │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │  PluginWorkerPool ── load cache, cleanup registry         │  │
//! │  │    └─ Supervisor (one per worker)                         │  │
//! │  │         - transaction registry: tx id -> pending call     │  │
//! │  │         - reader task: route results, detect exit         │  │
//! │  │    └─ RemotePlugin: createNodes / createDependencies /    │  │
//! │  │                     processProjectGraph                   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                   │
//! │           Unix socket (NDJSON, both directions)                 │
//! │                              ▼                                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             Worker process (one plugin, any runtime)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use plugin_workers::config::WorkerSettings;
//! use plugin_workers::worker::{PluginConfiguration, PluginWorkerPool};
//!
//! let pool = PluginWorkerPool::new(&WorkerSettings::with_program("./plugin-host"));
//! let (plugin, shutdown) = pool.load_plugin(PluginConfiguration::new("@acme/plugin"), "/repo");
//! let plugin = plugin.await?;
//!
//! if let Some(create_dependencies) = plugin.create_dependencies() {
//!     let edges = create_dependencies.call(json!({}), json!({})).await?;
//! }
//!
//! shutdown.shutdown().await;
//! ```

mod cleanup;
mod error;
mod handle;
pub mod launcher;
mod pool;
#[cfg(unix)]
mod process;
pub mod protocol;
mod supervisor;
mod transaction;

pub use cleanup::{CleanupRegistry, CleanupToken};
pub use error::{Operation, WorkerError, WorkerExit, WorkerResult};
pub use handle::{CreateDependencies, CreateNodes, ProcessProjectGraph, RemotePlugin};
pub use launcher::{WorkerLauncher, WorkerLink};
pub use pool::{LoadedPluginCache, PluginWorkerPool};
#[cfg(unix)]
pub use process::ProcessLauncher;
pub use protocol::{PluginConfiguration, RawDependency, RemoteError};
pub use supervisor::{LoadCache, PendingPlugin, ShutdownHandle, SupervisorOptions};
