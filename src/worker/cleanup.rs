//! Teardown callbacks for live workers.
//!
//! Every spawned worker registers a callback here and removes it when it is
//! shut down deliberately. Whatever is still registered when the host exits
//! is run by [`CleanupRegistry::run_all`], so no worker outlives its host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

const CLEANUP_TARGET: &str = "plugin_workers::cleanup";

type Teardown = Box<dyn FnOnce() + Send>;

/// Identifies one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupToken(u64);

#[derive(Default)]
struct Inner {
    next: u64,
    callbacks: HashMap<u64, Teardown>,
}

/// Shared set of teardown callbacks. Clones refer to the same set.
#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a teardown callback.
    pub fn register(&self, teardown: impl FnOnce() + Send + 'static) -> CleanupToken {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next += 1;
        inner.callbacks.insert(id, Box::new(teardown));
        CleanupToken(id)
    }

    /// Remove a callback without running it.
    pub fn remove(&self, token: CleanupToken) -> bool {
        self.inner.lock().callbacks.remove(&token.0).is_some()
    }

    /// Run and remove every registered callback. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let callbacks: Vec<Teardown> = {
            let mut inner = self.inner.lock();
            inner.callbacks.drain().map(|(_, teardown)| teardown).collect()
        };
        let count = callbacks.len();
        if count > 0 {
            debug!(target: CLEANUP_TARGET, count, "tearing down remaining plugin workers");
        }
        for teardown in callbacks {
            teardown();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("callbacks", &self.len())
            .finish()
    }
}
