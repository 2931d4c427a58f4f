//! Pool of plugin workers for one host.
//!
//! The pool owns the cleanup registry and a cache of loads keyed by plugin
//! configuration, so asking twice for the same plugin shares one worker.
//! Dropping the pool tears down every worker it still knows about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::cleanup::CleanupRegistry;
use super::error::WorkerResult;
use super::handle::RemotePlugin;
use super::launcher::WorkerLauncher;
use super::protocol::PluginConfiguration;
use super::supervisor::{self, LoadCache, PendingPlugin, ShutdownHandle, SupervisorOptions};

const POOL_TARGET: &str = "plugin_workers::pool";

type SharedLoad = Shared<BoxFuture<'static, WorkerResult<RemotePlugin>>>;

struct CachedLoad {
    load: SharedLoad,
    shutdown: ShutdownHandle,
}

/// Loads keyed by configuration.
#[derive(Default)]
pub struct LoadedPluginCache {
    entries: Mutex<HashMap<String, CachedLoad>>,
}

impl LoadedPluginCache {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, configuration: &PluginConfiguration) -> bool {
        self.entries.lock().contains_key(&configuration.cache_key())
    }

    fn shutdown_handles(&self) -> Vec<ShutdownHandle> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.shutdown.clone())
            .collect()
    }
}

impl LoadCache for LoadedPluginCache {
    fn evict(&self, configuration: &PluginConfiguration, worker: Uuid) {
        let key = configuration.cache_key();
        let mut entries = self.entries.lock();
        if entries
            .get(&key)
            .is_some_and(|entry| entry.shutdown.worker_id() == worker)
        {
            entries.remove(&key);
            debug!(target: POOL_TARGET, plugin = %configuration.plugin, "evicted plugin from cache");
        }
    }
}

/// Spawns and tracks plugin workers.
pub struct PluginWorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    options: SupervisorOptions,
    cleanup: CleanupRegistry,
    cache: Arc<LoadedPluginCache>,
}

impl PluginWorkerPool {
    /// Pool that runs workers as child processes.
    #[cfg(unix)]
    pub fn new(settings: &crate::config::WorkerSettings) -> Self {
        Self::with_launcher(
            Arc::new(super::process::ProcessLauncher::new(settings.clone())),
            settings.supervisor_options(),
        )
    }

    /// Pool that starts workers through `launcher`.
    pub fn with_launcher(launcher: Arc<dyn WorkerLauncher>, options: SupervisorOptions) -> Self {
        Self {
            launcher,
            options,
            cleanup: CleanupRegistry::new(),
            cache: Arc::new(LoadedPluginCache::default()),
        }
    }

    /// Teardown callbacks for every live worker of this pool.
    pub fn cleanup_registry(&self) -> &CleanupRegistry {
        &self.cleanup
    }

    /// The load cache used by [`load_plugins`](Self::load_plugins).
    pub fn cache(&self) -> &LoadedPluginCache {
        &self.cache
    }

    /// Spawn a fresh worker for `configuration`, bypassing the cache.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_plugin(
        &self,
        configuration: PluginConfiguration,
        root: impl Into<PathBuf>,
    ) -> (PendingPlugin, ShutdownHandle) {
        supervisor::spawn_worker(
            self.launcher.clone(),
            configuration,
            root.into(),
            self.options,
            self.cleanup.clone(),
            Some(self.cache.clone() as Arc<dyn LoadCache>),
        )
    }

    /// Load every configuration concurrently, reusing cached workers.
    ///
    /// Results come back in the order of `configurations`.
    pub async fn load_plugins(
        &self,
        configurations: &[PluginConfiguration],
        root: &Path,
    ) -> Vec<WorkerResult<RemotePlugin>> {
        let loads: Vec<SharedLoad> = configurations
            .iter()
            .map(|configuration| self.cached_load(configuration, root))
            .collect();
        future::join_all(loads).await
    }

    fn cached_load(&self, configuration: &PluginConfiguration, root: &Path) -> SharedLoad {
        let key = configuration.cache_key();
        if let Some(entry) = self.cache.entries.lock().get(&key) {
            return entry.load.clone();
        }

        let (pending, shutdown) = self.load_plugin(configuration.clone(), root);
        let load = {
            // A failed load is retired (which also evicts it) so the next
            // caller gets a fresh worker.
            let handle = shutdown.clone();
            pending
                .map(move |outcome| {
                    if outcome.is_err() {
                        tokio::spawn(async move { handle.shutdown().await });
                    }
                    outcome
                })
                .boxed()
                .shared()
        };
        let mut entries = self.cache.entries.lock();
        // Another caller may have raced us; keep the first worker.
        if let Some(entry) = entries.get(&key) {
            let existing = entry.load.clone();
            drop(entries);
            tokio::spawn(async move { shutdown.shutdown().await });
            return existing;
        }
        entries.insert(
            key,
            CachedLoad {
                load: load.clone(),
                shutdown,
            },
        );
        load
    }

    /// Shut down every cached worker, waiting for in-flight calls first.
    pub async fn shutdown_all(&self) {
        let handles = self.cache.shutdown_handles();
        debug!(target: POOL_TARGET, workers = handles.len(), "shutting down plugin workers");
        future::join_all(handles.iter().map(ShutdownHandle::shutdown)).await;
    }
}

impl Drop for PluginWorkerPool {
    fn drop(&mut self) {
        self.cleanup.run_all();
    }
}
