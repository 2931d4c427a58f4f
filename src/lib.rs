//! # Plugin Workers
//!
//! Runs workspace plugins out of process and calls them asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Settings (plugin-workers.toml)              │
//! │        (worker program, timeouts, plugin list)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [pool]
//! ┌─────────────────────────────────────────────────────────┐
//! │          PluginWorkerPool (load cache, cleanup)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [supervisor, one per worker]
//! ┌─────────────────────────────────────────────────────────┐
//! │     RemotePlugin handle  <─ tx id ─>  worker process     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [serve]
//! ┌─────────────────────────────────────────────────────────┐
//! │          WorkerPlugin implementation in the child        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod serve;
pub mod telemetry;
pub mod worker;

pub use config::{Settings, WorkerSettings};
pub use worker::{
    CleanupRegistry, PluginConfiguration, PluginWorkerPool, RawDependency, RemoteError,
    RemotePlugin, ShutdownHandle, WorkerError, WorkerResult,
};
