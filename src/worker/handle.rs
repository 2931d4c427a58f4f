//! The plugin handle given to the host once a worker has loaded.
//!
//! Only the operations the worker advertised in its `load-result` exist on the
//! handle. Each call opens a transaction on the worker and resolves when the
//! matching result arrives or the worker exits.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::error::{Operation, WorkerError, WorkerResult};
use super::protocol::{
    CreateDependenciesPayload, CreateNodesPayload, HostMessage, PluginCapabilities,
    ProcessProjectGraphPayload, RawDependency,
};
use super::supervisor::WorkerShared;
use super::transaction::OperationOutput;

/// Input of one operation call, before a transaction id is assigned.
pub(crate) enum OperationRequest {
    CreateNodes {
        config_files: Vec<String>,
        context: Value,
    },
    CreateDependencies {
        options: Value,
        context: Value,
    },
    ProcessProjectGraph {
        graph: Value,
        context: Value,
    },
}

impl OperationRequest {
    pub(crate) fn operation(&self) -> Operation {
        match self {
            Self::CreateNodes { .. } => Operation::CreateNodes,
            Self::CreateDependencies { .. } => Operation::CreateDependencies,
            Self::ProcessProjectGraph { .. } => Operation::ProcessProjectGraph,
        }
    }

    pub(crate) fn into_message(self, tx: String) -> HostMessage {
        match self {
            Self::CreateNodes {
                config_files,
                context,
            } => HostMessage::CreateNodes(CreateNodesPayload {
                config_files,
                context,
                tx,
            }),
            Self::CreateDependencies { options, context } => {
                HostMessage::CreateDependencies(CreateDependenciesPayload {
                    options,
                    context,
                    tx,
                })
            }
            Self::ProcessProjectGraph { graph, context } => {
                HostMessage::ProcessProjectGraph(ProcessProjectGraphPayload {
                    graph,
                    context,
                    tx,
                })
            }
        }
    }
}

fn unexpected(worker: &WorkerShared, operation: Operation, output: &OperationOutput) -> WorkerError {
    WorkerError::Protocol {
        worker: worker.label(),
        message: format!("{operation} settled with {output:?}"),
    }
}

/// A plugin running in its own worker process.
#[derive(Clone)]
pub struct RemotePlugin {
    name: String,
    worker: Arc<WorkerShared>,
    create_nodes: Option<CreateNodes>,
    create_dependencies: Option<CreateDependencies>,
    process_project_graph: Option<ProcessProjectGraph>,
}

impl RemotePlugin {
    pub(crate) fn new(capabilities: PluginCapabilities, worker: Arc<WorkerShared>) -> Self {
        let create_nodes = capabilities.create_nodes_pattern.map(|pattern| CreateNodes {
            pattern,
            worker: worker.clone(),
        });
        let create_dependencies = capabilities
            .has_create_dependencies
            .then(|| CreateDependencies {
                worker: worker.clone(),
            });
        let process_project_graph = capabilities
            .has_process_project_graph
            .then(|| ProcessProjectGraph {
                worker: worker.clone(),
            });

        Self {
            name: capabilities.name,
            worker,
            create_nodes,
            create_dependencies,
            process_project_graph,
        }
    }

    /// Name the plugin reported when it loaded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker behind this plugin is still running.
    pub fn is_alive(&self) -> bool {
        self.worker.is_alive()
    }

    /// The `createNodes` operation, if the plugin implements it.
    pub fn create_nodes(&self) -> Option<&CreateNodes> {
        self.create_nodes.as_ref()
    }

    /// The `createDependencies` operation, if the plugin implements it.
    pub fn create_dependencies(&self) -> Option<&CreateDependencies> {
        self.create_dependencies.as_ref()
    }

    /// The `processProjectGraph` operation, if the plugin implements it.
    pub fn process_project_graph(&self) -> Option<&ProcessProjectGraph> {
        self.process_project_graph.as_ref()
    }
}

impl fmt::Debug for RemotePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePlugin")
            .field("name", &self.name)
            .field(
                "create_nodes",
                &self.create_nodes.as_ref().map(CreateNodes::pattern),
            )
            .field("create_dependencies", &self.create_dependencies.is_some())
            .field("process_project_graph", &self.process_project_graph.is_some())
            .finish()
    }
}

/// `createNodes` on a remote plugin.
#[derive(Clone)]
pub struct CreateNodes {
    pattern: String,
    worker: Arc<WorkerShared>,
}

impl CreateNodes {
    /// Glob matching the files this plugin wants to see.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Infer nodes from the given configuration files.
    pub async fn call(&self, config_files: Vec<String>, context: Value) -> WorkerResult<Value> {
        let request = OperationRequest::CreateNodes {
            config_files,
            context,
        };
        match self.worker.call(request).await? {
            OperationOutput::Nodes(result) => Ok(result),
            other => Err(unexpected(&self.worker, Operation::CreateNodes, &other)),
        }
    }
}

/// `createDependencies` on a remote plugin.
#[derive(Clone)]
pub struct CreateDependencies {
    worker: Arc<WorkerShared>,
}

impl CreateDependencies {
    /// Compute dependency edges.
    pub async fn call(&self, options: Value, context: Value) -> WorkerResult<Vec<RawDependency>> {
        let request = OperationRequest::CreateDependencies { options, context };
        match self.worker.call(request).await? {
            OperationOutput::Dependencies(dependencies) => Ok(dependencies),
            other => Err(unexpected(
                &self.worker,
                Operation::CreateDependencies,
                &other,
            )),
        }
    }
}

/// `processProjectGraph` on a remote plugin.
#[derive(Clone)]
pub struct ProcessProjectGraph {
    worker: Arc<WorkerShared>,
}

impl ProcessProjectGraph {
    /// Hand the graph to the plugin and get back its transformed version.
    pub async fn call(&self, graph: Value, context: Value) -> WorkerResult<Value> {
        let request = OperationRequest::ProcessProjectGraph { graph, context };
        match self.worker.call(request).await? {
            OperationOutput::Graph(graph) => Ok(graph),
            other => Err(unexpected(
                &self.worker,
                Operation::ProcessProjectGraph,
                &other,
            )),
        }
    }
}
