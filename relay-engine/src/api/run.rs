//! Run API Handlers
//!
//! HTTP endpoints for creating, listing and inspecting pipeline runs.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::StageRunView;
use relay_core::dto::run::{CreateRun, ListRuns, UpdateRun};

use crate::api::error::{ApiError, ApiResult};
use crate::service::RunService;

// =============================================================================
// Run Endpoints
// =============================================================================

/// POST /pipeline/{pipeline_id}/runs
/// Create a run with its stages and jobs
pub async fn create_run(
    State(service): State<Arc<RunService>>,
    Path(pipeline_id): Path<i64>,
    Json(mut req): Json<CreateRun>,
) -> ApiResult<(StatusCode, Json<PipelineRun>)> {
    tracing::info!("Creating run for pipeline: {}", pipeline_id);

    req.pipeline_id = pipeline_id;
    let run = service.create_run(req).await?;

    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /pipeline/{pipeline_id}/runs
/// List runs of a pipeline, newest first
///
/// Query parameters:
/// - `before_build_number` (optional): only older builds
/// - `status` (optional): only runs with this status
/// - `limit` (optional): page size, 1 to 100, default 20
pub async fn list_runs(
    State(service): State<Arc<RunService>>,
    Path(pipeline_id): Path<i64>,
    Query(query): Query<ListRuns>,
) -> ApiResult<Json<Vec<PipelineRun>>> {
    tracing::debug!("Listing runs for pipeline: {}", pipeline_id);

    let runs = service.list_runs(pipeline_id, query).await?;
    Ok(Json(runs))
}

/// GET /pipeline/{pipeline_id}/runs/last
pub async fn last_run(
    State(service): State<Arc<RunService>>,
    Path(pipeline_id): Path<i64>,
) -> ApiResult<Json<PipelineRun>> {
    let run = service
        .last_run(pipeline_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Pipeline {} has no run", pipeline_id)))?;

    Ok(Json(run))
}

/// GET /run/{id}
pub async fn get_run(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(service.get_run(id).await?))
}

/// PUT /run/{id}
/// Set run status or env directly, without stage derivation
pub async fn update_run(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRun>,
) -> ApiResult<Json<PipelineRun>> {
    tracing::info!("Updating run: {}", id);

    Ok(Json(service.apply_run_update(id, req).await?))
}

/// GET /run/{id}/stages
/// Stages of a run in chain order
pub async fn list_stages(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<StageRunView>>> {
    // Unknown runs are a 404 rather than an empty chain
    service.get_run(id).await?;

    Ok(Json(service.ordered_stages(id).await?))
}

/// GET /run/{run_id}/stage/{stage_id}/next
/// Stage after `stage_id`; 204 when `stage_id` is the last one
pub async fn next_stage(
    State(service): State<Arc<RunService>>,
    Path((run_id, stage_id)): Path<(i64, i64)>,
) -> ApiResult<Response> {
    match service.next_stage(run_id, stage_id).await? {
        Some(stage) => Ok(Json(stage).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
