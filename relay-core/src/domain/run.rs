//! Pipeline run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::env::{ENV_BUILD_NUMBER, ENV_TRIGGER_USER, Env};
use super::status::Status;

/// One execution of a pipeline
///
/// `build_number` is unique and strictly increasing per pipeline. It is
/// assigned once, when the run is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub pipeline_id: i64,
    pub build_number: i64,
    pub status: Status,
    pub env: Env,
    pub operator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Reserved env entries as they follow from `build_number` and `operator`
    pub fn reserved_env(&self) -> Env {
        Env::from([
            (ENV_BUILD_NUMBER.to_string(), self.build_number.into()),
            (ENV_TRIGGER_USER.to_string(), self.operator.clone().into()),
        ])
    }

    /// Write the reserved entries into `env`, replacing whatever was there
    pub fn stamp_reserved_env(&mut self) {
        let reserved = self.reserved_env();
        self.env.extend(reserved);
    }
}
