//! Stage and job DTOs

use serde::{Deserialize, Serialize};

use crate::domain::env::Env;
use crate::domain::status::Status;

/// A stage to create as part of a new run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStage {
    pub name: String,
    #[serde(default)]
    pub custom_params: Env,
    #[serde(default)]
    pub jobs: Vec<CreateJob>,
}

/// A job to create inside a new stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    pub name: String,
    #[serde(default)]
    pub params: Env,
}

/// Progress reported for one job; absent fields are left as stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: i64,
    pub status: Option<Status>,
    pub env: Option<Env>,
    pub params: Option<Env>,
}

/// Stage update request
///
/// With `status`, the stage status is set verbatim (operator pause/resume).
/// Otherwise, when `jobs` is present, the stage status and env are derived
/// again from the stage's current jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStage {
    #[serde(default)]
    pub stage_id: i64,
    pub status: Option<Status>,
    pub jobs: Option<Vec<JobUpdate>>,
}

/// Direct stage write, e.g. an executor storing the env its jobs start with
///
/// Absent fields are left as stored. Job statuses are not consulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveStage {
    pub status: Option<Status>,
    pub env: Option<Env>,
}

/// New params for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub id: i64,
    pub params: Env,
}

/// Operator overrides for a stage and its jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStageParams {
    #[serde(default)]
    pub custom_params: Env,
    #[serde(default)]
    pub jobs: Vec<JobParams>,
}
