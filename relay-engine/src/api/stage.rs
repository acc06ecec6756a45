//! Stage and Job API Handlers
//!
//! HTTP endpoints used by job executors to report progress and fetch
//! their environment, and by operators to adjust params.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use relay_core::domain::env::Env;
use relay_core::domain::job::PipelineRunJob;
use relay_core::domain::log::JobRunLog;
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::{PipelineRunStage, StageRunView};
use relay_core::dto::log::AppendLog;
use relay_core::dto::stage::{SaveStage, UpdateStage, UpdateStageParams};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::service::RunService;

// =============================================================================
// Stage Endpoints
// =============================================================================

/// GET /stage/{id}
/// Stage with its jobs
pub async fn get_stage(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StageRunView>> {
    tracing::debug!("Getting stage: {}", id);

    Ok(Json(service.get_stage(id).await?))
}

/// PUT /stage/{id}
/// Set stage status or env directly, e.g. seeding the env its jobs start with
pub async fn save_stage(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Json(req): Json<SaveStage>,
) -> ApiResult<Json<PipelineRunStage>> {
    tracing::info!("Saving stage: {}", id);

    Ok(Json(service.apply_stage_save(id, req).await?))
}

/// GET /stage/{id}/env
/// Environment the stage's jobs start with
pub async fn env_before_stage(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Env>> {
    Ok(Json(service.env_before_stage(id).await?))
}

/// POST /stage/{id}/update
/// Report job progress and/or set the stage status
pub async fn update_stage(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Json(mut req): Json<UpdateStage>,
) -> ApiResult<Json<UpdateStageResponse>> {
    tracing::info!(
        "Updating stage: {} ({} job reports)",
        id,
        req.jobs.as_ref().map_or(0, Vec::len)
    );

    req.stage_id = id;
    let (run, stage) = service.update_stage_run(req).await?;

    Ok(Json(UpdateStageResponse { run, stage }))
}

/// PUT /stage/{id}/params
/// Replace custom params of the stage and params of its jobs
pub async fn update_stage_params(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateStageParams>,
) -> ApiResult<StatusCode> {
    service.update_stage_job_params(id, req).await?;

    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Job Endpoints
// =============================================================================

/// GET /job/{id}
pub async fn get_job(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineRunJob>> {
    tracing::debug!("Getting job: {}", id);

    Ok(Json(service.get_job(id).await?))
}

/// GET /job/{id}/log
/// Latest log record of a job, `null` while the job has not logged
///
/// Query parameters:
/// - `with_log` (optional, default true): include the log content
pub async fn get_job_log(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Query(query): Query<JobLogQuery>,
) -> ApiResult<Json<Option<JobRunLog>>> {
    let log = service
        .get_job_log(id, query.with_log.unwrap_or(true))
        .await?;

    Ok(Json(log))
}

/// POST /job/{id}/log
/// Store log output of a job
pub async fn append_job_log(
    State(service): State<Arc<RunService>>,
    Path(id): Path<i64>,
    Json(req): Json<AppendLog>,
) -> ApiResult<(StatusCode, Json<JobRunLog>)> {
    tracing::debug!("Adding {} bytes of log for job: {}", req.content.len(), id);

    let log = service.append_job_log(id, &req.content).await?;

    Ok((StatusCode::CREATED, Json(log)))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct JobLogQuery {
    pub with_log: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct UpdateStageResponse {
    pub run: PipelineRun,
    pub stage: PipelineRunStage,
}
