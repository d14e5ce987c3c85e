//! Reconcile cycle handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{extract::State, http::StatusCode, Json};
use fleet_manager::ReconcileState;
use serde::Serialize;

/// Whether a cycle or flush currently holds the reconcile lock
pub async fn reconcile_state(State(state): State<AppState>) -> Json<ReconcileState> {
    Json(state.scaler().state())
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub triggered: bool,
}

/// Ask the loop for a cycle now. The cycle runs asynchronously.
pub async fn trigger_reconcile(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    if !state.scheduler.trigger_reconcile() {
        return Err(ApiError::Unavailable(
            "reconcile loop is not running".to_string(),
        ));
    }
    tracing::info!("Reconcile cycle requested");
    Ok((StatusCode::ACCEPTED, Json(TriggerResponse { triggered: true })))
}
