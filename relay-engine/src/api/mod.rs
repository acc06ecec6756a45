//! API Module
//!
//! HTTP API layer for the run engine.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod run;
pub mod stage;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::service::RunService;

/// Create the main API router with all endpoints
pub fn create_router(service: Arc<RunService>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Run endpoints
        .route(
            "/pipeline/{pipeline_id}/runs",
            post(run::create_run).get(run::list_runs),
        )
        .route("/pipeline/{pipeline_id}/runs/last", get(run::last_run))
        .route("/run/{id}", get(run::get_run).put(run::update_run))
        .route("/run/{id}/stages", get(run::list_stages))
        .route(
            "/run/{run_id}/stage/{stage_id}/next",
            get(run::next_stage),
        )
        // Stage endpoints
        .route("/stage/{id}", get(stage::get_stage).put(stage::save_stage))
        .route("/stage/{id}/env", get(stage::env_before_stage))
        .route("/stage/{id}/update", post(stage::update_stage))
        .route("/stage/{id}/params", put(stage::update_stage_params))
        // Job endpoints
        .route("/job/{id}", get(stage::get_job))
        .route(
            "/job/{id}/log",
            get(stage::get_job_log).post(stage::append_job_log),
        )
        // Add state and middleware
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}
