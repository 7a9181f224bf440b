use crate::types::{NodeId, NodeStatus, RunId, RunStatus};
use thiserror::Error;

/// Errors surfaced by the execution engine
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    #[error("Graph has no entry point: every node has incoming edges")]
    NoEntryPoint,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Node {node_id} failed: {reason}")]
    ExecutorFailure { node_id: NodeId, reason: String },

    #[error("Node {node_id} rejected: {reason}")]
    ManualRejection { node_id: NodeId, reason: String },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("No executor registered for node kind: {0}")]
    UnknownNodeKind(String),

    #[error("Event log error: {0}")]
    EventLog(String),
}

impl EngineError {
    pub(crate) fn run_not_live(status: RunStatus, action: &str) -> Self {
        Self::InvalidStateTransition(format!("cannot {} a run that is {}", action, status))
    }

    pub(crate) fn node_not_gated(node_id: &NodeId, status: NodeStatus, action: &str) -> Self {
        Self::InvalidStateTransition(format!(
            "cannot {} node {}: status is {} and it is not awaiting approval",
            action, node_id, status
        ))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
