//! HTTP API for the readside daemon.
//!
//! Provides operator endpoints for:
//! - Health check
//! - Partition status and cluster leases
//! - Read-model debug view
//! - Restarting a faulted partition
//! - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use readside_domain::{Lease, Tag, UserGreeting, WorkerId};
use readside_projector::PartitionStatus;
use readside_store::{GreetingRepository, PartitionCoordinator, Store};

use crate::error::DaemonError;
use crate::metrics::ProjectionMetrics;
use crate::projection_worker::PartitionBoard;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState {
    pub worker_id: WorkerId,
    pub board: PartitionBoard,
    pub store: Arc<dyn Store>,
    pub coordinator: Arc<dyn PartitionCoordinator>,
    pub metrics: Arc<ProjectionMetrics>,
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub worker_id: String,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub worker_id: WorkerId,
    /// Partitions of this worker, in tag order
    pub partitions: Vec<PartitionStatus>,
    /// Live leases across the cluster
    pub leases: Vec<Lease>,
}

/// Read-model listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct GreetingsResponse {
    pub count: usize,
    pub greetings: Vec<UserGreeting>,
}

/// Response after a restart request.
#[derive(Debug, Serialize, Deserialize)]
pub struct RestartResponse {
    pub tag: String,
    pub restarting: bool,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/greetings", get(list_greetings_handler))
        .route("/greetings/:id", get(get_greeting_handler))
        .route("/partitions/:tag/restart", post(restart_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        worker_id: state.worker_id.to_string(),
    })
}

/// Partition status of this worker plus cluster leases.
async fn status_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let leases = state.coordinator.leases().await.map_err(|e| to_error_response(e.into()))?;

    Ok(Json(StatusResponse {
        worker_id: state.worker_id.clone(),
        partitions: state.board.statuses(),
        leases,
    }))
}

async fn list_greetings_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<GreetingsResponse>, ApiError> {
    let greetings = state.store.all_greetings().await.map_err(|e| to_error_response(e.into()))?;

    Ok(Json(GreetingsResponse { count: greetings.len(), greetings }))
}

async fn get_greeting_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<UserGreeting>, ApiError> {
    let greeting = state
        .store
        .find_greeting(&id)
        .await
        .map_err(|e| to_error_response(e.into()))?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse { error: format!("Greeting not found: {}", id) }),
            )
        })?;

    Ok(Json(greeting))
}

/// Restart a faulted partition.
async fn restart_handler(
    State(state): State<Arc<ApiState>>,
    Path(tag): Path<String>,
) -> Result<(StatusCode, Json<RestartResponse>), ApiError> {
    let tag = Tag::new(tag).map_err(|e| to_error_response(e.into()))?;
    state.board.restart(&tag).map_err(to_error_response)?;

    Ok((StatusCode::ACCEPTED, Json(RestartResponse { tag: tag.to_string(), restarting: true })))
}

/// Prometheus text format.
async fn metrics_handler(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    for status in state.board.statuses() {
        state.metrics.observe(&status);
    }
    let body = state.metrics.render().map_err(to_error_response)?;

    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

// =============================================================================
// Helpers
// =============================================================================

fn to_error_response(error: DaemonError) -> ApiError {
    let status = match &error {
        DaemonError::PartitionNotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::PartitionNotFaulted { .. } => StatusCode::CONFLICT,
        DaemonError::Domain(_) => StatusCode::BAD_REQUEST,
        DaemonError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(ErrorResponse { error: error.to_string() }))
}

// =============================================================================
// Tests
// =============================================================================
