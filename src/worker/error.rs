//! Worker-specific error types.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::protocol::RemoteError;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Plugin operations a worker can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateNodes,
    CreateDependencies,
    ProcessProjectGraph,
}

impl Operation {
    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateNodes => "createNodes",
            Self::CreateDependencies => "createDependencies",
            Self::ProcessProjectGraph => "processProjectGraph",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed.
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Errors that can occur during worker communication.
///
/// Cloneable so a single load outcome can be handed to every caller waiting
/// on the same plugin.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// Failed to spawn the worker process.
    #[error("failed to spawn plugin worker: {0}")]
    SpawnFailed(#[source] Arc<io::Error>),

    /// The worker never connected its message channel.
    #[error("plugin worker '{worker}' failed to connect: {message}")]
    ConnectFailed { worker: String, message: String },

    /// Failed to write to the worker channel.
    #[error("failed to write to plugin worker '{worker}': {source}")]
    WriteFailed {
        worker: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Failed to serialize a message to JSON.
    #[error("failed to serialize message: {0}")]
    SerializeFailed(#[source] Arc<serde_json::Error>),

    /// The worker could not initialise the plugin.
    #[error("failed to load plugin '{plugin}': {error}")]
    LoadFailed { plugin: String, error: RemoteError },

    /// The plugin reported an error for one call.
    #[error("plugin '{plugin}' failed during {operation}: {error}")]
    OperationFailed {
        plugin: String,
        operation: Operation,
        error: RemoteError,
    },

    /// The worker process went away while work was outstanding.
    #[error("plugin worker '{worker}' exited unexpectedly with {exit}")]
    WorkerExited { worker: String, exit: WorkerExit },

    /// The worker is being shut down and accepts no new calls.
    #[error("plugin worker '{worker}' is shutting down")]
    ShuttingDown { worker: String },

    /// A call exceeded the configured timeout.
    #[error("{operation} on plugin '{plugin}' timed out after {after:?}")]
    Timeout {
        plugin: String,
        operation: Operation,
        after: Duration,
    },

    /// The worker answered with something that does not fit the protocol.
    #[error("protocol violation from plugin worker '{worker}': {message}")]
    Protocol { worker: String, message: String },

    /// Invalid worker configuration.
    #[error("invalid worker configuration: {0}")]
    Config(String),

    /// Response channel was closed (internal error).
    #[error("response channel closed unexpectedly")]
    ChannelClosed,
}

impl WorkerError {
    /// Check if this error indicates the worker has exited.
    pub fn is_worker_exited(&self) -> bool {
        matches!(self, Self::WorkerExited { .. } | Self::ChannelClosed)
    }

    /// Check if retrying on a fresh worker could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::WorkerExited { .. } | Self::ChannelClosed
        )
    }

    /// The error reported by the plugin itself, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::LoadFailed { error, .. } | Self::OperationFailed { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
