//! Run DTOs

use serde::{Deserialize, Serialize};

use crate::domain::env::Env;
use crate::domain::status::Status;

use super::stage::CreateStage;

/// Request to create a run for a pipeline
///
/// Stages are chained in the order given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRun {
    #[serde(default)]
    pub pipeline_id: i64,
    pub operator: String,
    #[serde(default)]
    pub env: Env,
    pub stages: Vec<CreateStage>,
}

/// Run-level change that bypasses stage derivation (e.g. manual cancel)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRun {
    pub status: Option<Status>,
    pub env: Option<Env>,
}

/// Filter for listing a pipeline's runs, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRuns {
    /// Only runs with a build number strictly below this one
    pub before_build_number: Option<i64>,
    pub status: Option<Status>,
    pub limit: Option<i64>,
}
