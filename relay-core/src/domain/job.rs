//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::env::Env;
use super::status::Status;

/// One task inside a stage
///
/// The engine only records what executors report: `env` holds the outputs
/// produced by the job, `params` its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunJob {
    pub id: i64,
    pub stage_run_id: i64,
    pub name: String,
    pub status: Status,
    pub env: Env,
    pub params: Env,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
