//! The seam between a supervisor and whatever runs the worker.
//!
//! A [`WorkerLauncher`] produces a connected [`WorkerLink`]: the two halves of
//! the message channel, a future that completes when the worker is gone, and a
//! signal to ask for termination. The production launcher spawns a child
//! process; tests plug in in-memory links.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use super::error::{WorkerExit, WorkerResult};
use super::protocol::PluginConfiguration;

/// Read half of a worker channel.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Write half of a worker channel.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A connected worker.
pub struct WorkerLink {
    /// Messages from the worker.
    pub reader: BoxedReader,
    /// Messages to the worker.
    pub writer: BoxedWriter,
    /// Completes once the worker has exited.
    pub exit: BoxFuture<'static, WorkerExit>,
    /// Fire (or drop) to terminate the worker.
    pub terminate: oneshot::Sender<()>,
    /// Operating-system process id, when there is one.
    pub pid: Option<u32>,
}

/// Starts workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker for `configuration` and wait until its channel is
    /// connected.
    async fn launch(
        &self,
        configuration: &PluginConfiguration,
        root: &Path,
    ) -> WorkerResult<WorkerLink>;
}
