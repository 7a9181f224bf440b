use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a node within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unique identifier for an edge within a graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single node during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Waiting,
    Running,
    Processing,
    Succeeded,
    Failed,
}

impl NodeStatus {
    /// Succeeded or failed; no executor-driven transition leaves these.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Running or processing, i.e. an executor currently owns the node.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Processing)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Waiting => 1,
            Self::Running | Self::Processing => 2,
            Self::Succeeded | Self::Failed => 3,
        }
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Statuses only move forward; `waiting -> waiting` is the one allowed
    /// self-loop (a dependency re-check, or a gate opening after its
    /// dependencies resolved).
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return self == Self::Waiting;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Running or paused; control calls and executor reports are accepted.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    /// Selects the behavior category and executor
    pub kind: String,
    #[serde(default)]
    pub declared_inputs: Vec<String>,
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            kind: kind.into(),
            declared_inputs: vec!["input".to_string()],
            declared_outputs: vec!["output".to_string()],
            config: serde_json::Value::Null,
        }
    }

    pub fn with_ports(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.declared_inputs = inputs.iter().map(|p| p.to_string()).collect();
        self.declared_outputs = outputs.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Directed link from a source node's output port to a target node's input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub source_port: String,
    pub target_port: String,
}

impl Edge {
    /// Edge between the default `output` and `input` ports
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: EdgeId::new(id),
            source_node_id: NodeId::new(source),
            target_node_id: NodeId::new(target),
            source_port: "output".to_string(),
            target_port: "input".to_string(),
        }
    }
}

/// Graph submitted for execution; immutable for the duration of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<Node>,
    /// Declaration order is the fan-out order
    pub edges: Vec<Edge>,
}

/// Runtime record for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress_percent: Option<u8>,
    pub progress_message: Option<String>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    /// Blocking upstream ids while waiting on dependencies
    pub dependencies: Vec<NodeId>,
    /// Waiting on an approve/reject call rather than on dependencies
    pub awaiting_approval: bool,
}

impl NodeExecutionRecord {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Idle,
            started_at: None,
            ended_at: None,
            updated_at: Utc::now(),
            input: None,
            output: None,
            error: None,
            progress_percent: None,
            progress_message: None,
            estimated_completion_at: None,
            dependencies: Vec::new(),
            awaiting_approval: false,
        }
    }
}

/// The whole observable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunState {
    pub run_id: RunId,
    pub run_status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active_node_ids: BTreeSet<NodeId>,
    pub node_records: HashMap<NodeId, NodeExecutionRecord>,
    pub edge_data: HashMap<EdgeId, serde_json::Value>,
}

impl WorkflowRunState {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            run_status: RunStatus::Idle,
            started_at: None,
            ended_at: None,
            active_node_ids: BTreeSet::new(),
            node_records: HashMap::new(),
            edge_data: HashMap::new(),
        }
    }

    /// Status of a node, `idle` when no record exists yet
    pub fn node_status(&self, node_id: &NodeId) -> NodeStatus {
        self.node_records
            .get(node_id)
            .map(|r| r.status)
            .unwrap_or(NodeStatus::Idle)
    }

    pub fn record(&self, node_id: &NodeId) -> Option<&NodeExecutionRecord> {
        self.node_records.get(node_id)
    }
}
