//! Worker-side runtime for plugins written in Rust.
//!
//! A worker binary implements [`PluginLoader`] and calls [`serve_from_env`].
//! The runtime connects to the socket the host advertised, answers `load`, and
//! runs each operation on its own task so slow calls never block later ones.
//! Every reply carries the transaction id of its request.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::worker::protocol::{
    self, CreateDependenciesResultPayload, CreateNodesResultPayload, HostMessage,
    LoadResultPayload, PluginCapabilities, PluginConfiguration, ProcessProjectGraphResultPayload,
    RawDependency, RemoteError, WorkerMessage,
};

const SERVE_TARGET: &str = "plugin_workers::serve";

/// Errors that end the worker loop.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("{0} is not set; this program must be started by a plugin host")]
    MissingSocket(&'static str),

    #[error("I/O error on the host channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize reply: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A loaded plugin.
///
/// Only operations the plugin advertises through [`capabilities`] are ever
/// invoked by a host.
///
/// [`capabilities`]: WorkerPlugin::capabilities
#[async_trait]
pub trait WorkerPlugin: Send + Sync + 'static {
    fn capabilities(&self) -> PluginCapabilities;

    async fn create_nodes(
        &self,
        _config_files: Vec<String>,
        _context: Value,
    ) -> Result<Value, RemoteError> {
        Err(RemoteError::new("createNodes is not implemented"))
    }

    async fn create_dependencies(
        &self,
        _options: Value,
        _context: Value,
    ) -> Result<Vec<RawDependency>, RemoteError> {
        Err(RemoteError::new("createDependencies is not implemented"))
    }

    async fn process_project_graph(
        &self,
        _graph: Value,
        _context: Value,
    ) -> Result<Value, RemoteError> {
        Err(RemoteError::new("processProjectGraph is not implemented"))
    }
}

/// Builds a plugin from the configuration sent in `load`.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(
        &self,
        configuration: &PluginConfiguration,
        root: &Path,
    ) -> Result<Arc<dyn WorkerPlugin>, RemoteError>;
}

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

async fn reply<W>(writer: &SharedWriter<W>, message: &WorkerMessage) -> Result<(), ServeError>
where
    W: AsyncWrite + Unpin,
{
    let line = protocol::encode(message)?;
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Connect to the host named by the environment and serve until it hangs up.
#[cfg(unix)]
pub async fn serve_from_env<L: PluginLoader>(loader: L) -> Result<(), ServeError> {
    let socket = std::env::var_os(protocol::SOCKET_ENV)
        .ok_or(ServeError::MissingSocket(protocol::SOCKET_ENV))?;
    let stream = tokio::net::UnixStream::connect(socket).await?;
    let (reader, writer) = stream.into_split();
    serve(loader, reader, writer).await
}

/// Serve host requests read from `reader`, replying on `writer`.
pub async fn serve<L, R, W>(loader: L, reader: R, writer: W) -> Result<(), ServeError>
where
    L: PluginLoader,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(BufWriter::new(writer)));
    let mut lines = BufReader::new(reader).lines();
    let mut plugin: Option<Arc<dyn WorkerPlugin>> = None;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match protocol::decode::<HostMessage>(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: SERVE_TARGET, error = %err, "dropping undecodable message from host");
                continue;
            }
        };
        debug!(target: SERVE_TARGET, kind = message.kind(), "received message");

        if let HostMessage::Load(payload) = message {
            let result = match loader.load(&payload.plugin, &payload.root).await {
                Ok(loaded) => {
                    let result = LoadResultPayload::loaded(loaded.capabilities());
                    plugin = Some(loaded);
                    result
                }
                Err(error) => LoadResultPayload::failed(error),
            };
            reply(&writer, &WorkerMessage::LoadResult(result)).await?;
            continue;
        }

        let loaded = plugin.clone();
        let writer = writer.clone();
        let reply_to = ReplyTo::of(&message);
        tokio::spawn(async move {
            let reply_message = match AssertUnwindSafe(run_operation(loaded, message))
                .catch_unwind()
                .await
            {
                Ok(reply_message) => reply_message,
                Err(panic) => {
                    let error = RemoteError {
                        name: Some("Panic".to_string()),
                        message: panic_message(panic.as_ref()),
                        stack: None,
                    };
                    warn!(target: SERVE_TARGET, %error, "plugin operation panicked");
                    reply_to.failure(error)
                }
            };
            if let Err(err) = reply(&writer, &reply_message).await {
                warn!(target: SERVE_TARGET, error = %err, "failed to send reply");
            }
        });
    }

    debug!(target: SERVE_TARGET, "host closed the channel");
    Ok(())
}

/// Where the reply to an operation goes, kept apart from the request so a
/// failure can still be answered after the request was consumed.
enum ReplyTo {
    Nodes(String),
    Dependencies(String),
    Graph(String),
    Load,
}

impl ReplyTo {
    fn of(message: &HostMessage) -> Self {
        match message {
            HostMessage::CreateNodes(payload) => Self::Nodes(payload.tx.clone()),
            HostMessage::CreateDependencies(payload) => Self::Dependencies(payload.tx.clone()),
            HostMessage::ProcessProjectGraph(payload) => Self::Graph(payload.tx.clone()),
            HostMessage::Load(_) => Self::Load,
        }
    }

    fn failure(self, error: RemoteError) -> WorkerMessage {
        match self {
            Self::Nodes(tx) => WorkerMessage::CreateNodesResult(
                CreateNodesResultPayload::from_outcome(tx, Err(error)),
            ),
            Self::Dependencies(tx) => WorkerMessage::CreateDependenciesResult(
                CreateDependenciesResultPayload::from_outcome(tx, Err(error)),
            ),
            Self::Graph(tx) => WorkerMessage::ProcessProjectGraphResult(
                ProcessProjectGraphResultPayload::from_outcome(tx, Err(error)),
            ),
            Self::Load => WorkerMessage::LoadResult(LoadResultPayload::failed(error)),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "plugin panicked".to_string()
    }
}

async fn run_operation(plugin: Option<Arc<dyn WorkerPlugin>>, message: HostMessage) -> WorkerMessage {
    let not_loaded = || RemoteError::new("plugin is not loaded");
    match message {
        HostMessage::CreateNodes(payload) => {
            let outcome = match plugin {
                Some(plugin) => plugin.create_nodes(payload.config_files, payload.context).await,
                None => Err(not_loaded()),
            };
            WorkerMessage::CreateNodesResult(CreateNodesResultPayload::from_outcome(
                payload.tx, outcome,
            ))
        }
        HostMessage::CreateDependencies(payload) => {
            let outcome = match plugin {
                Some(plugin) => {
                    plugin
                        .create_dependencies(payload.options, payload.context)
                        .await
                }
                None => Err(not_loaded()),
            };
            WorkerMessage::CreateDependenciesResult(CreateDependenciesResultPayload::from_outcome(
                payload.tx, outcome,
            ))
        }
        HostMessage::ProcessProjectGraph(payload) => {
            let outcome = match plugin {
                Some(plugin) => {
                    plugin
                        .process_project_graph(payload.graph, payload.context)
                        .await
                }
                None => Err(not_loaded()),
            };
            WorkerMessage::ProcessProjectGraphResult(
                ProcessProjectGraphResultPayload::from_outcome(payload.tx, outcome),
            )
        }
        HostMessage::Load(_) => {
            ReplyTo::Load.failure(RemoteError::new("load must be handled before operations"))
        }
    }
}
