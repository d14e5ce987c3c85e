//! Health and status handlers

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use fleet_manager::{ReconcileReport, ReconcileState};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    let status = if state.scheduler.is_running().await {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthCheckResponse {
        status: status.to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

/// Daemon status response
#[derive(Debug, Serialize)]
pub struct DaemonStatusResponse {
    pub version: String,
    pub uptime: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub prefix: String,
    pub desired_runners: usize,
    pub scheduler_running: bool,
    pub reconcile: ReconcileState,
    pub last_report: Option<ReconcileReport>,
}

/// Daemon status endpoint
pub async fn daemon_status(State(state): State<AppState>) -> Json<DaemonStatusResponse> {
    let scaler = state.scaler();

    Json(DaemonStatusResponse {
        version: state.version.clone(),
        uptime: state.uptime(),
        started_at: state.started_at,
        prefix: scaler.manager().prefix().to_string(),
        desired_runners: scaler.desired(),
        scheduler_running: state.scheduler.is_running().await,
        reconcile: scaler.state(),
        last_report: scaler.last_report(),
    })
}
