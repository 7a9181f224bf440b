use crate::error::{EngineError, EngineResult};
use crate::types::{
    EdgeId, NodeExecutionRecord, NodeId, NodeStatus, RunId, RunStatus, WorkflowRunState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Partial update of a node record; unset fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub status: Option<NodeStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub progress_percent: Option<u8>,
    pub progress_message: Option<String>,
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub dependencies: Option<Vec<NodeId>>,
    pub awaiting_approval: Option<bool>,
}

impl NodePatch {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn is_progress_only(&self) -> bool {
        self.status.is_none()
            && (self.progress_percent.is_some()
                || self.progress_message.is_some()
                || self.estimated_completion_at.is_some())
    }
}

/// Holder of one run's state.
///
/// Writes go through compare-and-set checks: terminal records never change,
/// statuses only move forward, and progress is accepted only while a node is
/// processing. The scheduler is the only writer; everyone else reads
/// snapshots.
#[derive(Clone)]
pub struct ExecutionStateStore {
    state: Arc<RwLock<WorkflowRunState>>,
}

impl ExecutionStateStore {
    pub fn new(run_id: RunId) -> Self {
        Self {
            state: Arc::new(RwLock::new(WorkflowRunState::new(run_id))),
        }
    }

    pub async fn get(&self, node_id: &NodeId) -> Option<NodeExecutionRecord> {
        self.state.read().await.node_records.get(node_id).cloned()
    }

    pub async fn snapshot(&self) -> WorkflowRunState {
        self.state.read().await.clone()
    }

    pub async fn run_status(&self) -> RunStatus {
        self.state.read().await.run_status
    }

    /// Apply a patch, creating the record on first touch.
    /// Returns the status the record had before the patch.
    pub async fn upsert(&self, node_id: &NodeId, patch: NodePatch) -> EngineResult<NodeStatus> {
        let mut state = self.state.write().await;
        let previous = state.node_status(node_id);

        if previous.is_terminal() {
            return Err(EngineError::InvalidStateTransition(format!(
                "node {} is already {}",
                node_id, previous
            )));
        }
        if let Some(next) = patch.status {
            if !previous.can_transition_to(next) {
                return Err(EngineError::InvalidStateTransition(format!(
                    "node {} cannot move from {} to {}",
                    node_id, previous, next
                )));
            }
        }
        if patch.is_progress_only() && previous != NodeStatus::Processing {
            return Err(EngineError::InvalidStateTransition(format!(
                "node {} is {} and cannot take progress reports",
                node_id, previous
            )));
        }

        let record = state
            .node_records
            .entry(node_id.clone())
            .or_insert_with(|| NodeExecutionRecord::new(node_id.clone()));

        let NodePatch {
            status,
            started_at,
            ended_at,
            input,
            output,
            error,
            progress_percent,
            progress_message,
            estimated_completion_at,
            dependencies,
            awaiting_approval,
        } = patch;

        if let Some(status) = status {
            record.status = status;
            if status != NodeStatus::Waiting {
                record.dependencies.clear();
                record.awaiting_approval = false;
            }
            if status == NodeStatus::Succeeded {
                record.progress_percent = Some(100);
            }
        }
        if started_at.is_some() {
            record.started_at = started_at;
        }
        if ended_at.is_some() {
            record.ended_at = ended_at;
        }
        if input.is_some() {
            record.input = input;
        }
        if output.is_some() {
            record.output = output;
        }
        if error.is_some() {
            record.error = error;
        }
        if progress_percent.is_some() {
            record.progress_percent = progress_percent;
        }
        if progress_message.is_some() {
            record.progress_message = progress_message;
        }
        if estimated_completion_at.is_some() {
            record.estimated_completion_at = estimated_completion_at;
        }
        if let Some(dependencies) = dependencies {
            record.dependencies = dependencies;
        }
        if let Some(awaiting) = awaiting_approval {
            record.awaiting_approval = awaiting;
        }
        record.updated_at = Utc::now();

        let current = record.status;
        if current.is_active() {
            state.active_node_ids.insert(node_id.clone());
        } else {
            state.active_node_ids.remove(node_id);
        }

        Ok(previous)
    }

    pub async fn set_edge_data(&self, edge_id: &EdgeId, value: serde_json::Value) {
        self.state
            .write()
            .await
            .edge_data
            .insert(edge_id.clone(), value);
    }

    /// Values present on the given edges, read under one lock
    pub async fn edge_values(&self, edge_ids: &[EdgeId]) -> HashMap<EdgeId, serde_json::Value> {
        let state = self.state.read().await;
        edge_ids
            .iter()
            .filter_map(|id| state.edge_data.get(id).map(|v| (id.clone(), v.clone())))
            .collect()
    }

    /// Mark the run started
    pub async fn begin(&self, started_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.run_status = RunStatus::Running;
        state.started_at = Some(started_at);
        state.ended_at = None;
    }

    pub async fn set_run_status(&self, status: RunStatus) -> RunStatus {
        let mut state = self.state.write().await;
        std::mem::replace(&mut state.run_status, status)
    }

    /// Finalize the run in place
    pub async fn finish(&self, status: RunStatus, ended_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.run_status = status;
        state.ended_at = Some(ended_at);
        state.active_node_ids.clear();
    }

    /// Drop every record and edge value, back to an idle run
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let run_id = state.run_id;
        *state = WorkflowRunState::new(run_id);
    }
}
