//! Launches workers as child processes.
//!
//! The host binds a Unix socket inside a fresh directory only the current user
//! can enter, and passes its path to the child in [`SOCKET_ENV`]. The child's stdin is null and its stdout and
//! stderr are inherited, so plugin output stays visible while protocol
//! traffic goes over the socket.

use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{WorkerError, WorkerExit, WorkerResult};
use super::launcher::{WorkerLauncher, WorkerLink};
use super::protocol::{PluginConfiguration, ROOT_ENV, SOCKET_ENV};
use crate::config::WorkerSettings;

/// Tracing target for worker process events.
const PROCESS_TARGET: &str = "plugin_workers::process";

/// Per-launch socket directory, mode 0700.
///
/// Removed with its socket once the worker has connected or failed to.
struct SocketDir(PathBuf);

impl SocketDir {
    fn create_in(parent: &Path) -> io::Result<Self> {
        let path = parent.join(format!("plugin-worker-{}", Uuid::new_v4().simple()));
        std::fs::DirBuilder::new().mode(0o700).create(&path)?;
        Ok(Self(path))
    }

    fn socket(&self) -> PathBuf {
        self.0.join("worker.sock")
    }
}

impl Drop for SocketDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Spawns the configured plugin-host program once per worker.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    settings: WorkerSettings,
}

impl ProcessLauncher {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    fn command(&self, root: &Path, socket: &Path) -> WorkerResult<Command> {
        let program = self
            .settings
            .resolved_program()
            .map_err(|err| WorkerError::Config(err.to_string()))?;
        let env = self
            .settings
            .resolved_env()
            .map_err(|err| WorkerError::Config(err.to_string()))?;

        let mut command = Command::new(program);
        command
            .args(&self.settings.args)
            .current_dir(root)
            .envs(env)
            .env(SOCKET_ENV, socket)
            .env(ROOT_ENV, root)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some((var, file)) = self.settings.project_config(root) {
            command.env(var, file);
        }
        Ok(command)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        configuration: &PluginConfiguration,
        root: &Path,
    ) -> WorkerResult<WorkerLink> {
        let socket_dir = SocketDir::create_in(&std::env::temp_dir())
            .map_err(|err| WorkerError::SpawnFailed(Arc::new(err)))?;
        let socket = socket_dir.socket();
        let listener =
            UnixListener::bind(&socket).map_err(|err| WorkerError::SpawnFailed(Arc::new(err)))?;

        let mut child = self
            .command(root, &socket)?
            .spawn()
            .map_err(|err| WorkerError::SpawnFailed(Arc::new(err)))?;
        let pid = child.id();
        let worker = pid.map_or_else(|| configuration.plugin.clone(), |pid| format!("pid {pid}"));

        debug!(
            target: PROCESS_TARGET,
            plugin = %configuration.plugin,
            ?pid,
            socket = %socket.display(),
            "spawned plugin worker"
        );

        let timeout = self.settings.connect_timeout();
        let stream = tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(err)) => {
                    return Err(WorkerError::ConnectFailed { worker, message: err.to_string() });
                }
                Err(_) => {
                    warn!(target: PROCESS_TARGET, %worker, "worker did not connect in time");
                    return Err(WorkerError::ConnectFailed {
                        worker,
                        message: format!("no connection after {timeout:?}"),
                    });
                }
            },
            status = child.wait() => {
                let exit = status.map(WorkerExit::from).unwrap_or_default();
                return Err(WorkerError::WorkerExited { worker, exit });
            }
        };

        let (reader, writer) = stream.into_split();
        let (terminate, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(monitor(child, worker, terminate_rx, exit_tx));

        Ok(WorkerLink {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            exit: Box::pin(async move { exit_rx.await.unwrap_or_default() }),
            terminate,
            pid,
        })
    }
}

/// Own the child until it exits, killing it when asked to (or when the
/// supervisor goes away).
async fn monitor(
    mut child: Child,
    worker: String,
    terminate: oneshot::Receiver<()>,
    exit: oneshot::Sender<WorkerExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate => {
            debug!(target: PROCESS_TARGET, %worker, "terminating plugin worker");
            if let Err(err) = child.start_kill() {
                debug!(target: PROCESS_TARGET, %worker, error = %err, "kill failed");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => WorkerExit::from(status),
        Err(err) => {
            warn!(target: PROCESS_TARGET, %worker, error = %err, "failed to wait for worker");
            WorkerExit::default()
        }
    };
    let _ = exit.send(status);
}
