//! One supervisor per worker: spawns it, routes its replies, and settles
//! every outstanding call when it exits.
//!
//! A background task owns the read side of the channel. Lines are decoded and
//! dispatched by kind; results are matched to transactions by id, never by
//! arrival order. When the worker exits (or its channel closes), every call
//! still registered is rejected with an error naming the worker and its exit
//! status.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cleanup::{CleanupRegistry, CleanupToken};
use super::error::{Operation, WorkerError, WorkerExit, WorkerResult};
use super::handle::{OperationRequest, RemotePlugin};
use super::launcher::{BoxedReader, BoxedWriter, WorkerLauncher};
use super::protocol::{
    self, CreateDependenciesResultPayload, CreateNodesResultPayload, HostMessage, LoadPayload,
    LoadResultPayload, PluginConfiguration, ProcessProjectGraphResultPayload, RemoteError,
    WorkerMessage, WorkerMessageHandler,
};
use super::transaction::{OperationOutput, Registration, TransactionRegistry};

/// Tracing target for supervisor events.
const SUPERVISOR_TARGET: &str = "plugin_workers::supervisor";

/// Default time to keep reading buffered replies after the worker exits.
const DEFAULT_EXIT_DRAIN_MILLIS: u64 = 100;

/// Tunables for a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Upper bound on a single call. `None` waits for as long as the worker
    /// lives.
    pub call_timeout: Option<Duration>,
    /// How long to keep reading replies already in flight once the worker has
    /// exited.
    pub exit_drain: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            call_timeout: None,
            exit_drain: Duration::from_millis(DEFAULT_EXIT_DRAIN_MILLIS),
        }
    }
}

/// Something that remembers loaded plugins and must forget a worker once it
/// has been shut down.
pub trait LoadCache: Send + Sync {
    /// Forget `worker` if it is the cached entry for `configuration`.
    fn evict(&self, configuration: &PluginConfiguration, worker: Uuid);
}

enum Termination {
    /// Not connected yet; remember whether termination was already asked for.
    Unattached { requested: bool },
    Attached(oneshot::Sender<()>),
    Sent,
}

/// State shared between the reader task, the plugin handle, and the shutdown
/// handle.
pub(crate) struct WorkerShared {
    id: Uuid,
    configuration: PluginConfiguration,
    name: OnceCell<String>,
    pid: OnceCell<u32>,
    writer: tokio::sync::Mutex<Option<BufWriter<BoxedWriter>>>,
    transactions: TransactionRegistry,
    load: Mutex<Option<oneshot::Sender<WorkerResult<RemotePlugin>>>>,
    termination: Mutex<Termination>,
    alive: AtomicBool,
    shutting_down: AtomicBool,
    exited: watch::Sender<Option<WorkerExit>>,
    options: SupervisorOptions,
}

impl WorkerShared {
    /// How the worker is named in logs and errors: the plugin's reported name,
    /// else its pid, else the configured plugin.
    pub(crate) fn label(&self) -> String {
        if let Some(name) = self.name.get() {
            return name.clone();
        }
        match self.pid.get() {
            Some(pid) => format!("pid {pid}"),
            None => self.configuration.plugin.clone(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn last_exit(&self) -> WorkerExit {
        (*self.exited.borrow()).unwrap_or_default()
    }

    async fn send(&self, message: &HostMessage) -> WorkerResult<()> {
        let line =
            protocol::encode(message).map_err(|err| WorkerError::SerializeFailed(Arc::new(err)))?;
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(WorkerError::ChannelClosed);
        };
        let write_failed = |err| WorkerError::WriteFailed {
            worker: self.label(),
            source: Arc::new(err),
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(write_failed)?;
        writer.flush().await.map_err(write_failed)
    }

    /// Issue one operation and wait for its settlement.
    pub(crate) async fn call(&self, request: OperationRequest) -> WorkerResult<OperationOutput> {
        let operation = request.operation();
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown {
                worker: self.label(),
            });
        }

        let tx = self.transactions.next_id(&self.label(), operation);
        // Register before sending so an immediate reply always finds its entry.
        let Some(receiver) = self.transactions.open(tx.clone(), operation) else {
            return Err(WorkerError::WorkerExited {
                worker: self.label(),
                exit: self.last_exit(),
            });
        };
        let registration = Registration::new(&self.transactions, tx);

        debug!(
            target: SUPERVISOR_TARGET,
            worker = %self.label(),
            %operation,
            tx = registration.tx(),
            "sending request"
        );
        self.send(&request.into_message(registration.tx().to_string()))
            .await?;

        let settled = match self.options.call_timeout {
            Some(limit) => tokio::time::timeout(limit, receiver).await.map_err(|_| {
                warn!(
                    target: SUPERVISOR_TARGET,
                    worker = %self.label(),
                    %operation,
                    tx = registration.tx(),
                    "call timed out"
                );
                WorkerError::Timeout {
                    plugin: self.label(),
                    operation,
                    after: limit,
                }
            })?,
            None => receiver.await,
        };
        settled?
    }

    fn resolve_load(&self, outcome: WorkerResult<RemotePlugin>) -> bool {
        match self.load.lock().take() {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    fn request_termination(&self) {
        let mut termination = self.termination.lock();
        match std::mem::replace(&mut *termination, Termination::Sent) {
            Termination::Unattached { .. } => {
                *termination = Termination::Unattached { requested: true };
            }
            Termination::Attached(sender) => {
                let _ = sender.send(());
            }
            Termination::Sent => {}
        }
    }

    fn attach_termination(&self, sender: oneshot::Sender<()>) {
        let mut termination = self.termination.lock();
        match std::mem::replace(&mut *termination, Termination::Sent) {
            Termination::Unattached { requested: true } => {
                let _ = sender.send(());
            }
            Termination::Unattached { requested: false } => {
                *termination = Termination::Attached(sender);
            }
            Termination::Attached(_) | Termination::Sent => {}
        }
    }

    fn handle_exit(&self, exit: WorkerExit) {
        self.alive.store(false, Ordering::Release);
        let worker = self.label();
        if self.shutting_down.load(Ordering::Acquire) {
            debug!(target: SUPERVISOR_TARGET, %worker, %exit, "plugin worker stopped");
        } else {
            warn!(target: SUPERVISOR_TARGET, %worker, %exit, "plugin worker exited");
        }

        let exited = || WorkerError::WorkerExited {
            worker: worker.clone(),
            exit,
        };
        self.resolve_load(Err(exited()));
        let rejected = self.transactions.close(exited);
        if rejected > 0 {
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                rejected,
                "rejected calls outstanding at worker exit"
            );
        }
        // Writes after this point fail fast instead of hitting a dead pipe.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.exited.send_replace(Some(exit));
    }
}

/// Operation answered by a result envelope of the given wire kind.
fn result_operation(kind: &str) -> Option<Operation> {
    match kind {
        "createNodesResult" => Some(Operation::CreateNodes),
        "createDependenciesResult" => Some(Operation::CreateDependencies),
        "processProjectGraphResult" => Some(Operation::ProcessProjectGraph),
        _ => None,
    }
}

/// Routes decoded worker messages for one worker.
struct Router {
    worker: Arc<WorkerShared>,
}

impl Router {
    fn route(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match protocol::decode::<WorkerMessage>(line) {
            Ok(message) => {
                debug!(
                    target: SUPERVISOR_TARGET,
                    worker = %self.worker.label(),
                    kind = message.kind(),
                    "received message"
                );
                protocol::dispatch(message, self);
            }
            Err(err) => self.reject_undecodable(line, &err),
        }
    }

    /// A line that failed typed decoding still settles whatever it was
    /// addressed to, so the waiting caller sees the protocol error.
    fn reject_undecodable(&self, line: &str, err: &serde_json::Error) {
        let worker = self.worker.label();
        let Some(header) = protocol::peek_envelope(line) else {
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                error = %err,
                "dropping undecodable message from worker"
            );
            return;
        };

        if header.kind == "load-result" {
            let rejected = self.worker.resolve_load(Err(WorkerError::Protocol {
                worker: worker.clone(),
                message: format!("undecodable load-result: {err}"),
            }));
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                error = %err,
                rejected,
                "undecodable load-result"
            );
            return;
        }

        let (Some(reported), Some(tx)) = (result_operation(&header.kind), header.tx) else {
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                kind = %header.kind,
                error = %err,
                "dropping undecodable message from worker"
            );
            return;
        };
        let Some(pending) = self.worker.transactions.take(&tx) else {
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                tx = %tx,
                error = %err,
                "dropping undecodable result for unknown transaction"
            );
            return;
        };

        warn!(
            target: SUPERVISOR_TARGET,
            %worker,
            tx = %tx,
            operation = %reported,
            error = %err,
            "rejecting call with undecodable result"
        );
        pending.settle(Err(WorkerError::Protocol {
            worker,
            message: format!("undecodable {reported} result for transaction '{tx}': {err}"),
        }));
    }

    fn settle(&self, reported: Operation, tx: &str, outcome: Result<OperationOutput, RemoteError>) {
        let worker = self.worker.label();
        let Some(pending) = self.worker.transactions.take(tx) else {
            warn!(
                target: SUPERVISOR_TARGET,
                %worker,
                tx = %tx,
                operation = %reported,
                "dropping result for unknown transaction"
            );
            return;
        };

        let expected = pending.operation();
        let settlement = if expected != reported {
            Err(WorkerError::Protocol {
                worker,
                message: format!("{reported} result for {expected} transaction '{tx}'"),
            })
        } else {
            outcome.map_err(|error| WorkerError::OperationFailed {
                plugin: worker,
                operation: reported,
                error,
            })
        };

        debug!(
            target: SUPERVISOR_TARGET,
            tx,
            success = settlement.is_ok(),
            "settling transaction"
        );
        pending.settle(settlement);
    }
}

impl WorkerMessageHandler for Router {
    fn on_load_result(&self, payload: LoadResultPayload) {
        let plugin = self.worker.configuration.plugin.clone();
        let outcome = match payload.into_outcome() {
            Ok(capabilities) => {
                let _ = self.worker.name.set(capabilities.name.clone());
                info!(
                    target: SUPERVISOR_TARGET,
                    %plugin,
                    name = %capabilities.name,
                    "plugin loaded"
                );
                Ok(RemotePlugin::new(capabilities, self.worker.clone()))
            }
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, %plugin, %error, "plugin failed to load");
                Err(WorkerError::LoadFailed { plugin, error })
            }
        };
        if !self.worker.resolve_load(outcome) {
            warn!(
                target: SUPERVISOR_TARGET,
                worker = %self.worker.label(),
                "ignoring repeated load-result"
            );
        }
    }

    fn on_create_nodes_result(&self, payload: CreateNodesResultPayload) {
        let tx = payload.tx.clone();
        let outcome = payload.into_outcome().map(OperationOutput::Nodes);
        self.settle(Operation::CreateNodes, &tx, outcome);
    }

    fn on_create_dependencies_result(&self, payload: CreateDependenciesResultPayload) {
        let tx = payload.tx.clone();
        let outcome = payload.into_outcome().map(OperationOutput::Dependencies);
        self.settle(Operation::CreateDependencies, &tx, outcome);
    }

    fn on_process_project_graph_result(&self, payload: ProcessProjectGraphResultPayload) {
        let tx = payload.tx.clone();
        let outcome = payload.into_outcome().map(OperationOutput::Graph);
        self.settle(Operation::ProcessProjectGraph, &tx, outcome);
    }
}

/// Future of a plugin that is still loading.
pub struct PendingPlugin {
    receiver: oneshot::Receiver<WorkerResult<RemotePlugin>>,
}

impl Future for PendingPlugin {
    type Output = WorkerResult<RemotePlugin>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(WorkerError::ChannelClosed)))
    }
}

/// Shuts a worker down deliberately. Cloning shares the same worker.
#[derive(Clone)]
pub struct ShutdownHandle {
    worker: Arc<WorkerShared>,
    cleanup: CleanupRegistry,
    token: CleanupToken,
    cache: Option<Arc<dyn LoadCache>>,
}

impl ShutdownHandle {
    /// Unique id of the worker behind this handle.
    pub fn worker_id(&self) -> Uuid {
        self.worker.id
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    /// Wait for in-flight calls to settle, then terminate the worker.
    ///
    /// New calls are refused as soon as shutdown begins. Only the first
    /// invocation has any effect.
    pub async fn shutdown(&self) {
        if self.worker.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cleanup.remove(self.token);
        if let Some(cache) = &self.cache {
            cache.evict(&self.worker.configuration, self.worker.id);
        }

        let worker = self.worker.label();
        let pending = self.worker.transactions.len();
        debug!(target: SUPERVISOR_TARGET, %worker, pending, "shutting down plugin worker");
        self.worker.transactions.drained().await;
        self.worker.request_termination();
    }

    /// Wait until the worker has exited and report how.
    pub async fn wait_for_exit(&self) -> WorkerExit {
        let mut exited = self.worker.exited.subscribe();
        let exit = match exited.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            Err(_) => self.worker.last_exit(),
        };
        exit
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("worker", &self.worker.label())
            .field("id", &self.worker.id)
            .finish()
    }
}

/// Start a worker for `configuration` and begin loading it.
///
/// Returns immediately: the plugin handle arrives through the returned
/// future, and the shutdown handle is usable even while loading.
pub(crate) fn spawn_worker(
    launcher: Arc<dyn WorkerLauncher>,
    configuration: PluginConfiguration,
    root: PathBuf,
    options: SupervisorOptions,
    cleanup: CleanupRegistry,
    cache: Option<Arc<dyn LoadCache>>,
) -> (PendingPlugin, ShutdownHandle) {
    let (load_tx, load_rx) = oneshot::channel();
    let (exited, _) = watch::channel(None);
    let worker = Arc::new(WorkerShared {
        id: Uuid::new_v4(),
        configuration,
        name: OnceCell::new(),
        pid: OnceCell::new(),
        writer: tokio::sync::Mutex::new(None),
        transactions: TransactionRegistry::new(),
        load: Mutex::new(Some(load_tx)),
        termination: Mutex::new(Termination::Unattached { requested: false }),
        alive: AtomicBool::new(true),
        shutting_down: AtomicBool::new(false),
        exited,
        options,
    });

    let token = {
        let worker = worker.clone();
        cleanup.register(move || worker.request_termination())
    };

    tokio::spawn(drive(worker.clone(), launcher, root));

    let handle = ShutdownHandle {
        worker,
        cleanup,
        token,
        cache,
    };
    (PendingPlugin { receiver: load_rx }, handle)
}

async fn drive(worker: Arc<WorkerShared>, launcher: Arc<dyn WorkerLauncher>, root: PathBuf) {
    debug!(
        target: SUPERVISOR_TARGET,
        plugin = %worker.configuration.plugin,
        root = %root.display(),
        "launching plugin worker"
    );
    let link = match launcher.launch(&worker.configuration, &root).await {
        Ok(link) => link,
        Err(err) => {
            warn!(
                target: SUPERVISOR_TARGET,
                plugin = %worker.configuration.plugin,
                error = %err,
                "failed to launch plugin worker"
            );
            worker.alive.store(false, Ordering::Release);
            worker.resolve_load(Err(err));
            worker.transactions.close(|| WorkerError::ChannelClosed);
            worker.exited.send_replace(Some(WorkerExit::default()));
            return;
        }
    };

    if let Some(pid) = link.pid {
        let _ = worker.pid.set(pid);
    }
    *worker.writer.lock().await = Some(BufWriter::new(link.writer));
    worker.attach_termination(link.terminate);

    let load = HostMessage::Load(LoadPayload {
        plugin: worker.configuration.clone(),
        root,
    });
    if let Err(err) = worker.send(&load).await {
        worker.resolve_load(Err(err));
        worker.request_termination();
    }

    let router = Router {
        worker: worker.clone(),
    };
    let exit = pump(&router, link.reader, link.exit, worker.options.exit_drain).await;
    worker.handle_exit(exit);
}

/// Read and route messages until the worker is gone.
async fn pump(
    router: &Router,
    reader: BoxedReader,
    mut exit: BoxFuture<'static, WorkerExit>,
    drain: Duration,
) -> WorkerExit {
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => router.route(&line),
                Ok(None) => {
                    debug!(
                        target: SUPERVISOR_TARGET,
                        worker = %router.worker.label(),
                        "worker channel closed"
                    );
                    break (&mut exit).await;
                }
                Err(err) => {
                    warn!(
                        target: SUPERVISOR_TARGET,
                        worker = %router.worker.label(),
                        error = %err,
                        "failed to read from worker"
                    );
                    break (&mut exit).await;
                }
            },
            status = &mut exit => {
                // Replies written just before exit may still be buffered.
                let _ = tokio::time::timeout(drain, async {
                    while let Ok(Some(line)) = lines.next_line().await {
                        router.route(&line);
                    }
                })
                .await;
                break status;
            }
        }
    }
}
