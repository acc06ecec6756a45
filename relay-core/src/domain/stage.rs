//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::env::Env;
use super::job::PipelineRunJob;
use super::status::Status;

/// One node of a run's stage chain
///
/// Ordering is a back-reference: `prev_stage_run_id` is the id of the stage
/// before this one, or 0 for the first stage of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunStage {
    pub id: i64,
    pub pipeline_run_id: i64,
    pub prev_stage_run_id: i64,
    pub name: String,
    pub status: Status,
    pub env: Env,
    pub custom_params: Env,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRunStage {
    pub fn is_first(&self) -> bool {
        self.prev_stage_run_id == 0
    }
}

/// A stage together with its jobs, as returned to readers and watchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRunView {
    #[serde(flatten)]
    pub stage: PipelineRunStage,
    pub jobs: Vec<PipelineRunJob>,
}
