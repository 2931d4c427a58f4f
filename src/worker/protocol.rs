//! Protocol types for host/worker communication.
//!
//! Every message is a single line of JSON shaped as
//! `{"type": <kind>, "payload": {...}}`. The host sends [`HostMessage`]s and
//! the worker answers with [`WorkerMessage`]s. Operation messages carry a
//! transaction id (`tx`) so replies can arrive in any order.
//!
//! This is the only module that knows the shape of a payload; the supervisor
//! and the worker-side runtime only ever match on the message kind.

use std::fmt;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Environment variable naming the socket a worker connects back to.
pub const SOCKET_ENV: &str = "PLUGIN_WORKER_SOCKET";

/// Environment variable carrying the workspace root handed to a worker.
pub const ROOT_ENV: &str = "PLUGIN_WORKER_ROOT";

// ============================================================================
// Plugin configuration
// ============================================================================

/// How to locate and instantiate a plugin.
///
/// Accepts either a bare string (`"my-plugin"`) or the full object form with
/// options and file filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PluginConfigurationRepr", rename_all = "camelCase")]
pub struct PluginConfiguration {
    /// Module specifier or path of the plugin.
    pub plugin: String,
    /// Plugin-specific options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Glob patterns the plugin is restricted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// Glob patterns the plugin must skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PluginConfigurationRepr {
    Name(String),
    Full {
        plugin: String,
        #[serde(default)]
        options: Option<Value>,
        #[serde(default)]
        include: Option<Vec<String>>,
        #[serde(default)]
        exclude: Option<Vec<String>>,
    },
}

impl From<PluginConfigurationRepr> for PluginConfiguration {
    fn from(repr: PluginConfigurationRepr) -> Self {
        match repr {
            PluginConfigurationRepr::Name(plugin) => Self::new(plugin),
            PluginConfigurationRepr::Full {
                plugin,
                options,
                include,
                exclude,
            } => Self {
                plugin,
                options,
                include,
                exclude,
            },
        }
    }
}

impl PluginConfiguration {
    /// Configuration for a plugin with no options.
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            options: None,
            include: None,
            exclude: None,
        }
    }

    /// Attach plugin options.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Stable key identifying this configuration in the load cache.
    pub fn cache_key(&self) -> String {
        // Object keys are sorted by serde_json's default map, so equal
        // configurations always produce equal keys.
        serde_json::to_string(self).unwrap_or_else(|_| self.plugin.clone())
    }
}

// ============================================================================
// Shared payload types
// ============================================================================

/// Error reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RemoteErrorRepr")]
pub struct RemoteError {
    /// Error class name, if the worker runtime has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Stack trace captured in the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteErrorRepr {
    Message(String),
    Full {
        #[serde(default)]
        name: Option<String>,
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl From<RemoteErrorRepr> for RemoteError {
    fn from(repr: RemoteErrorRepr) -> Self {
        match repr {
            RemoteErrorRepr::Message(message) => Self::new(message),
            RemoteErrorRepr::Full {
                name,
                message,
                stack,
            } => Self {
                name,
                message,
                stack,
            },
        }
    }
}

impl RemoteError {
    /// Create an error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    fn missing(field: &str) -> Self {
        Self {
            name: Some("ProtocolError".to_string()),
            message: format!("worker reported success without `{field}`"),
            stack: None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Kind of edge reported by `createDependencies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Static,
    Dynamic,
    Implicit,
}

/// A dependency edge between two projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDependency {
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub dependency_type: Option<DependencyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl RawDependency {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            dependency_type: None,
            source_file: None,
        }
    }
}

// ============================================================================
// Host -> worker
// ============================================================================

/// Messages sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum HostMessage {
    #[serde(rename = "load")]
    Load(LoadPayload),
    #[serde(rename = "createNodes")]
    CreateNodes(CreateNodesPayload),
    #[serde(rename = "createDependencies")]
    CreateDependencies(CreateDependenciesPayload),
    #[serde(rename = "processProjectGraph")]
    ProcessProjectGraph(ProcessProjectGraphPayload),
}

impl HostMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::CreateNodes(_) => "createNodes",
            Self::CreateDependencies(_) => "createDependencies",
            Self::ProcessProjectGraph(_) => "processProjectGraph",
        }
    }
}

/// Payload of `load`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPayload {
    pub plugin: PluginConfiguration,
    pub root: PathBuf,
}

/// Payload of `createNodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodesPayload {
    pub config_files: Vec<String>,
    #[serde(default)]
    pub context: Value,
    pub tx: String,
}

/// Payload of `createDependencies`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDependenciesPayload {
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub context: Value,
    pub tx: String,
}

/// Payload of `processProjectGraph`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessProjectGraphPayload {
    pub graph: Value,
    #[serde(default)]
    pub context: Value,
    pub tx: String,
}

// ============================================================================
// Worker -> host
// ============================================================================

/// Messages sent from a worker back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkerMessage {
    #[serde(rename = "load-result")]
    LoadResult(LoadResultPayload),
    #[serde(rename = "createNodesResult")]
    CreateNodesResult(CreateNodesResultPayload),
    #[serde(rename = "createDependenciesResult")]
    CreateDependenciesResult(CreateDependenciesResultPayload),
    #[serde(rename = "processProjectGraphResult")]
    ProcessProjectGraphResult(ProcessProjectGraphResultPayload),
}

impl WorkerMessage {
    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoadResult(_) => "load-result",
            Self::CreateNodesResult(_) => "createNodesResult",
            Self::CreateDependenciesResult(_) => "createDependenciesResult",
            Self::ProcessProjectGraphResult(_) => "processProjectGraphResult",
        }
    }
}

/// What a successfully loaded plugin can do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCapabilities {
    pub name: String,
    /// File pattern for `createNodes`; `None` when the plugin has no such hook.
    pub create_nodes_pattern: Option<String>,
    pub has_create_dependencies: bool,
    pub has_process_project_graph: bool,
}

/// Payload of `load-result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_nodes_pattern: Option<String>,
    #[serde(default)]
    pub has_create_dependencies: bool,
    #[serde(default)]
    pub has_process_project_graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl LoadResultPayload {
    /// Successful load advertising the given capabilities.
    pub fn loaded(capabilities: PluginCapabilities) -> Self {
        Self {
            success: true,
            name: Some(capabilities.name),
            create_nodes_pattern: capabilities.create_nodes_pattern,
            has_create_dependencies: capabilities.has_create_dependencies,
            has_process_project_graph: capabilities.has_process_project_graph,
            error: None,
        }
    }

    /// Failed load.
    pub fn failed(error: RemoteError) -> Self {
        Self {
            success: false,
            name: None,
            create_nodes_pattern: None,
            has_create_dependencies: false,
            has_process_project_graph: false,
            error: Some(error),
        }
    }

    /// Interpret the payload as either capabilities or the reported error.
    pub fn into_outcome(self) -> Result<PluginCapabilities, RemoteError> {
        if !self.success {
            return Err(self.error.unwrap_or_else(|| RemoteError::new("unknown error")));
        }
        let name = self.name.ok_or_else(|| RemoteError::missing("name"))?;
        Ok(PluginCapabilities {
            name,
            create_nodes_pattern: self.create_nodes_pattern,
            has_create_dependencies: self.has_create_dependencies,
            has_process_project_graph: self.has_process_project_graph,
        })
    }
}

/// Payload of `createNodesResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNodesResultPayload {
    pub tx: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl CreateNodesResultPayload {
    pub fn from_outcome(tx: String, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(result) => Self {
                tx,
                success: true,
                result: Some(result),
                error: None,
            },
            Err(error) => Self {
                tx,
                success: false,
                result: None,
                error: Some(error),
            },
        }
    }

    pub fn into_outcome(self) -> Result<Value, RemoteError> {
        outcome(self.success, self.result, self.error, "result")
    }
}

/// Payload of `createDependenciesResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDependenciesResultPayload {
    pub tx: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<RawDependency>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl CreateDependenciesResultPayload {
    pub fn from_outcome(tx: String, outcome: Result<Vec<RawDependency>, RemoteError>) -> Self {
        match outcome {
            Ok(dependencies) => Self {
                tx,
                success: true,
                dependencies: Some(dependencies),
                error: None,
            },
            Err(error) => Self {
                tx,
                success: false,
                dependencies: None,
                error: Some(error),
            },
        }
    }

    pub fn into_outcome(self) -> Result<Vec<RawDependency>, RemoteError> {
        outcome(self.success, self.dependencies, self.error, "dependencies")
    }
}

/// Payload of `processProjectGraphResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessProjectGraphResultPayload {
    pub tx: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ProcessProjectGraphResultPayload {
    pub fn from_outcome(tx: String, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(graph) => Self {
                tx,
                success: true,
                graph: Some(graph),
                error: None,
            },
            Err(error) => Self {
                tx,
                success: false,
                graph: None,
                error: Some(error),
            },
        }
    }

    pub fn into_outcome(self) -> Result<Value, RemoteError> {
        outcome(self.success, self.graph, self.error, "graph")
    }
}

fn outcome<T>(
    success: bool,
    value: Option<T>,
    error: Option<RemoteError>,
    field: &str,
) -> Result<T, RemoteError> {
    if success {
        value.ok_or_else(|| RemoteError::missing(field))
    } else {
        Err(error.unwrap_or_else(|| RemoteError::new("unknown error")))
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Receives worker messages, one method per kind.
pub trait WorkerMessageHandler {
    fn on_load_result(&self, payload: LoadResultPayload);
    fn on_create_nodes_result(&self, payload: CreateNodesResultPayload);
    fn on_create_dependencies_result(&self, payload: CreateDependenciesResultPayload);
    fn on_process_project_graph_result(&self, payload: ProcessProjectGraphResultPayload);
}

/// Route a worker message to the handler method for its kind.
pub fn dispatch<H: WorkerMessageHandler + ?Sized>(message: WorkerMessage, handler: &H) {
    match message {
        WorkerMessage::LoadResult(payload) => handler.on_load_result(payload),
        WorkerMessage::CreateNodesResult(payload) => handler.on_create_nodes_result(payload),
        WorkerMessage::CreateDependenciesResult(payload) => {
            handler.on_create_dependencies_result(payload)
        }
        WorkerMessage::ProcessProjectGraphResult(payload) => {
            handler.on_process_project_graph_result(payload)
        }
    }
}

// ============================================================================
// Line framing
// ============================================================================

/// Encode a message as one newline-terminated JSON line.
pub fn encode<M: Serialize>(message: &M) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line. Unknown `type` values are rejected.
pub fn decode<M: DeserializeOwned>(line: &str) -> Result<M, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

/// Envelope of a line whose typed payload may not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub kind: String,
    pub tx: Option<String>,
}

/// Read `type` and `payload.tx` from a line without decoding the payload.
///
/// `None` when the line is not a JSON object with a string `type`.
pub fn peek_envelope(line: &str) -> Option<EnvelopeHeader> {
    let value: Value = serde_json::from_str(line.trim_end()).ok()?;
    let kind = value.get("type")?.as_str()?.to_string();
    let tx = value
        .get("payload")
        .and_then(|payload| payload.get("tx"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(EnvelopeHeader { kind, tx })
}
