//! Snapshot events emitted to watchers

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::run::PipelineRun;
use crate::domain::stage::StageRunView;

/// Event type of run snapshots
pub const EVENT_TYPE_PIPELINE_RUN: &str = "pipeline-run";
/// Label carrying the event type
pub const LABEL_TYPE: &str = "type";
/// Label carrying the pipeline id
pub const LABEL_PIPELINE: &str = "pipeline";

/// Full state of a run after a mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: String,
    pub labels: HashMap<String, String>,
    pub run: PipelineRun,
    pub stages: Vec<StageRunView>,
}

impl RunEvent {
    /// Snapshot of `run` routed by run id and pipeline id
    pub fn pipeline_run(run: PipelineRun, stages: Vec<StageRunView>) -> Self {
        let labels = HashMap::from([
            (LABEL_TYPE.to_string(), EVENT_TYPE_PIPELINE_RUN.to_string()),
            (EVENT_TYPE_PIPELINE_RUN.to_string(), run.id.to_string()),
            (LABEL_PIPELINE.to_string(), run.pipeline_id.to_string()),
        ]);

        Self {
            event_type: EVENT_TYPE_PIPELINE_RUN.to_string(),
            labels,
            run,
            stages,
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run.id
    }

    pub fn pipeline_id(&self) -> i64 {
        self.run.pipeline_id
    }
}
