use crate::config::{AppState, ServerConfig};
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flowrun_core::EngineError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config);

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/node-kinds", get(handlers::list_node_kinds))
        .route(
            "/api/runs",
            get(handlers::list_runs).post(handlers::create_run),
        )
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/events", get(handlers::get_run_events))
        .route("/api/runs/{run_id}/pause", post(handlers::pause_run))
        .route("/api/runs/{run_id}/resume", post(handlers::resume_run))
        .route("/api/runs/{run_id}/stop", post(handlers::stop_run))
        .route(
            "/api/runs/{run_id}/nodes/{node_id}/approve",
            post(handlers::approve_node),
        )
        .route(
            "/api/runs/{run_id}/nodes/{node_id}/reject",
            post(handlers::reject_node),
        )
        .route("/api/ws", get(websocket::ws_handler))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "flowrun",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Engine(e) => match e {
                EngineError::RunNotFound(_) | EngineError::NodeNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::InvalidStateTransition(_) => StatusCode::CONFLICT,
                EngineError::MalformedGraph(_)
                | EngineError::NoEntryPoint
                | EngineError::UnknownNodeKind(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::ExecutorFailure { .. }
                | EngineError::ManualRejection { .. }
                | EngineError::EventLog(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Engine(EngineError::MalformedGraph(_)) => "malformed_graph",
            Self::Engine(EngineError::NoEntryPoint) => "no_entry_point",
            Self::Engine(EngineError::InvalidStateTransition(_)) => "invalid_state_transition",
            Self::Engine(EngineError::ExecutorFailure { .. }) => "executor_failure",
            Self::Engine(EngineError::ManualRejection { .. }) => "manual_rejection",
            Self::Engine(EngineError::RunNotFound(_)) => "run_not_found",
            Self::Engine(EngineError::NodeNotFound(_)) => "node_not_found",
            Self::Engine(EngineError::UnknownNodeKind(_)) => "unknown_node_kind",
            Self::Engine(EngineError::EventLog(_)) => "event_log",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let response = ErrorResponse::with_details(self.kind(), self.to_string());
        (status, Json(response)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
