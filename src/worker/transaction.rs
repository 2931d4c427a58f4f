//! Per-worker registry of in-flight calls.
//!
//! Each entry owns the sending half of a oneshot channel. The only way to
//! settle a call is to [`take`](TransactionRegistry::take) its entry out of the
//! map and consume it, so a transaction can be settled at most once. Closing
//! the registry rejects whatever is left and refuses new entries, so a call
//! opened after the worker died can never hang.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};

use super::error::{Operation, WorkerError, WorkerResult};
use super::protocol::RawDependency;

/// Successful output of an operation, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OperationOutput {
    Nodes(Value),
    Dependencies(Vec<RawDependency>),
    Graph(Value),
}

pub(crate) type Settlement = WorkerResult<OperationOutput>;

/// A registered call that has been removed from the registry and is ready to
/// be settled.
pub(crate) struct PendingTransaction {
    operation: Operation,
    settle: oneshot::Sender<Settlement>,
}

impl PendingTransaction {
    pub(crate) fn operation(&self) -> Operation {
        self.operation
    }

    /// Deliver the outcome. Returns `false` if the caller stopped waiting.
    pub(crate) fn settle(self, outcome: Settlement) -> bool {
        self.settle.send(outcome).is_ok()
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, PendingTransaction>,
    closed: bool,
}

/// Map from transaction id to pending call for one worker.
pub(crate) struct TransactionRegistry {
    next: AtomicU64,
    state: Mutex<State>,
    pending: watch::Sender<usize>,
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            next: AtomicU64::new(1),
            state: Mutex::new(State::default()),
            pending,
        }
    }

    /// Fresh id, unique for the lifetime of this registry.
    pub(crate) fn next_id(&self, plugin: &str, operation: Operation) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{plugin}:{operation}:{n}")
    }

    /// Register a call. Returns `None` once the registry is closed.
    pub(crate) fn open(
        &self,
        tx: String,
        operation: Operation,
    ) -> Option<oneshot::Receiver<Settlement>> {
        let (settle, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state
            .entries
            .insert(tx, PendingTransaction { operation, settle });
        self.pending.send_replace(state.entries.len());
        Some(receiver)
    }

    /// Remove a call so it can be settled. `None` if unknown or already gone.
    pub(crate) fn take(&self, tx: &str) -> Option<PendingTransaction> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(tx)?;
        self.pending.send_replace(state.entries.len());
        Some(entry)
    }

    /// Drop a call whose caller is no longer waiting.
    pub(crate) fn forget(&self, tx: &str) -> bool {
        self.take(tx).is_some()
    }

    /// Reject every pending call and refuse new ones. Returns how many were
    /// rejected.
    pub(crate) fn close(&self, error: impl Fn() -> WorkerError) -> usize {
        let drained: Vec<PendingTransaction> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained = state.entries.drain().map(|(_, entry)| entry).collect();
            self.pending.send_replace(0);
            drained
        };
        let count = drained.len();
        for entry in drained {
            entry.settle(Err(error()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no calls are pending.
    pub(crate) async fn drained(&self) {
        let mut pending = self.pending.subscribe();
        // The sender lives as long as `self`, so this only ends at zero.
        let _ = pending.wait_for(|count| *count == 0).await;
    }
}

/// Removes a transaction when the call future is dropped, whether it was
/// settled, timed out, or abandoned by its caller.
pub(crate) struct Registration<'a> {
    registry: &'a TransactionRegistry,
    tx: String,
}

impl<'a> Registration<'a> {
    pub(crate) fn new(registry: &'a TransactionRegistry, tx: String) -> Self {
        Self { registry, tx }
    }

    pub(crate) fn tx(&self) -> &str {
        &self.tx
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.forget(&self.tx);
    }
}
