use super::{ApiError, ApiResult};
use crate::config::AppState;
use crate::simulation::{NodeKindInfo, NODE_KINDS};
use axum::{
    extract::{Path, State},
    Json,
};
use flowrun_core::{
    events::Event, NodeId, RunId, RunStatus, WorkflowGraph, WorkflowRunState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid run ID: {}", raw)))
}

/// List the node kinds this server can execute
pub async fn list_node_kinds() -> Json<ListNodeKindsResponse> {
    Json(ListNodeKindsResponse {
        node_kinds: NODE_KINDS.to_vec(),
        count: NODE_KINDS.len(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListNodeKindsResponse {
    pub node_kinds: Vec<NodeKindInfo>,
    pub count: usize,
}

/// List all runs, oldest first
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<ListRunsResponse> {
    let mut runs = Vec::new();
    for (run_id, status) in state.engine.runs().await {
        let started_at = state
            .engine
            .snapshot(run_id)
            .await
            .ok()
            .and_then(|s| s.started_at);
        runs.push(RunSummary {
            run_id,
            status,
            started_at,
        });
    }
    runs.sort_by_key(|r| r.started_at);
    Json(ListRunsResponse { runs })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<RunSummary>,
}

/// Submit a graph and start executing it
pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(graph): Json<WorkflowGraph>,
) -> ApiResult<Json<CreateRunResponse>> {
    let run_id = state.engine.start(graph).await?;
    tracing::info!("Started workflow run: run_id={}", run_id);
    Ok(Json(CreateRunResponse { run_id }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
}

/// Get the current state of a run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<WorkflowRunState>> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.engine.snapshot(run_id).await?))
}

/// Get events for a run
pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let events = state.engine.events(run_id).await?;
    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

pub async fn pause_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.engine.pause(run_id).await?;
    Ok(Json(ControlResponse::new(run_id, "Run paused")))
}

pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.engine.resume(run_id).await?;
    Ok(Json(ControlResponse::new(run_id, "Run resumed")))
}

pub async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state.engine.stop(run_id).await?;
    Ok(Json(ControlResponse::new(run_id, "Run stopped")))
}

/// Approve a node waiting on a manual gate
pub async fn approve_node(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state
        .engine
        .approve(run_id, NodeId::new(node_id.as_str()), req.data)
        .await?;
    Ok(Json(ControlResponse::new(
        run_id,
        format!("Node {} approved", node_id),
    )))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Reject a node waiting on a manual gate; this fails the run
pub async fn reject_node(
    State(state): State<Arc<AppState>>,
    Path((run_id, node_id)): Path<(String, String)>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Json<ControlResponse>> {
    let run_id = parse_run_id(&run_id)?;
    state
        .engine
        .reject(run_id, NodeId::new(node_id.as_str()), req.reason)
        .await?;
    Ok(Json(ControlResponse::new(
        run_id,
        format!("Node {} rejected", node_id),
    )))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default = "default_reject_reason")]
    pub reason: String,
}

fn default_reject_reason() -> String {
    "rejected".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub run_id: RunId,
    pub message: String,
}

impl ControlResponse {
    fn new(run_id: RunId, message: impl Into<String>) -> Self {
        Self {
            run_id,
            message: message.into(),
        }
    }
}
