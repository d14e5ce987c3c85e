//! Runner listing and flush handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Query, State},
    Json,
};
use fleet_manager::{DeleteOutcome, FlushMode, RunnerFilter};
use fleet_types::{RunnerCondition, RunnerInstance};
use serde::{Deserialize, Serialize};

/// Runner with its reconciliation class
#[derive(Debug, Serialize)]
pub struct RunnerInfo {
    pub name: String,

    #[serde(flatten)]
    pub runner: RunnerInstance,

    #[serde(flatten)]
    pub condition: RunnerCondition,
}

/// List the runners owned by this daemon
pub async fn list_runners(State(state): State<AppState>) -> ApiResult<Json<Vec<RunnerInfo>>> {
    let manager = state.scaler().manager();
    let runners = manager.get_runners(&RunnerFilter::all()).await?;

    let infos = runners
        .into_iter()
        .map(|runner| RunnerInfo {
            name: runner.name(),
            condition: manager.classify(&runner),
            runner,
        })
        .collect();

    Ok(Json(infos))
}

#[derive(Debug, Default, Deserialize)]
pub struct FlushQuery {
    /// Delete busy runners too
    #[serde(default)]
    pub busy: bool,
}

/// Delete idle runners, or every runner with `?busy=true`.
///
/// Waits for a running reconcile cycle to finish first.
pub async fn flush_runners(
    State(state): State<AppState>,
    Query(query): Query<FlushQuery>,
) -> ApiResult<Json<DeleteOutcome>> {
    let mode = if query.busy {
        FlushMode::FlushBusy
    } else {
        FlushMode::FlushIdle
    };

    tracing::info!(?mode, "Flush requested");
    let outcome = state.scaler().flush(mode).await?;
    Ok(Json(outcome))
}
