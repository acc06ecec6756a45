//! Repository Module
//!
//! Data access layer for the run engine.
//!
//! [`RunStore`] is the persistence contract the service is written against:
//! non-locking reads, a few direct writes, and [`RunTx`] units of work that
//! take row locks and either commit as a whole or roll back. Dropping an
//! uncommitted transaction rolls it back.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use relay_core::domain::env::Env;
use relay_core::domain::job::PipelineRunJob;
use relay_core::domain::log::JobRunLog;
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::PipelineRunStage;
use relay_core::domain::status::Status;

pub use memory::MemoryRunStore;
pub use postgres::PgRunStore;

/// Store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Filter for [`RunStore::list_runs`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunFilter {
    pub pipeline_id: i64,
    pub before_build_number: Option<i64>,
    pub status: Option<Status>,
    pub limit: i64,
}

/// Persistence contract of the run engine
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Start a unit of work
    async fn begin(&self) -> StoreResult<Box<dyn RunTx>>;

    async fn find_run(&self, id: i64) -> StoreResult<Option<PipelineRun>>;

    /// Most recent run of a pipeline
    async fn last_run(&self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>>;

    /// Runs of a pipeline, newest first
    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>>;

    /// Overwrite a run row as is
    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()>;

    async fn find_stage(&self, id: i64) -> StoreResult<Option<PipelineRunStage>>;

    /// Overwrite a stage row as is
    async fn save_stage(&self, stage: &PipelineRunStage) -> StoreResult<()>;

    /// All stages of a run, in no particular order
    async fn stages_of_run(&self, run_id: i64) -> StoreResult<Vec<PipelineRunStage>>;

    async fn find_job(&self, id: i64) -> StoreResult<Option<PipelineRunJob>>;

    async fn jobs_of_stage(&self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>>;

    /// Most recent log record of a job; without content unless `with_content`
    async fn last_job_log(
        &self,
        job_id: i64,
        with_content: bool,
    ) -> StoreResult<Option<JobRunLog>>;

    async fn insert_job_log(&self, job_id: i64, content: &str) -> StoreResult<JobRunLog>;
}

/// A unit of work against the store
///
/// Locks taken through `lock_*` are held until `commit` or drop.
#[async_trait]
pub trait RunTx: Send {
    /// Lock and read the most recent run of a pipeline.
    ///
    /// Serializes with every other transaction locking the same pipeline,
    /// including when the pipeline has no run yet.
    async fn lock_last_run(&mut self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>>;

    /// Lock and read a stage row
    async fn lock_stage(&mut self, id: i64) -> StoreResult<Option<PipelineRunStage>>;

    async fn find_run(&mut self, id: i64) -> StoreResult<Option<PipelineRun>>;

    async fn find_job(&mut self, id: i64) -> StoreResult<Option<PipelineRunJob>>;

    async fn jobs_of_stage(&mut self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>>;

    /// Insert a run; `run.id` is ignored and the assigned id returned
    async fn insert_run(&mut self, run: &PipelineRun) -> StoreResult<i64>;

    /// Insert a stage; `stage.id` is ignored and the assigned id returned
    async fn insert_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<i64>;

    /// Insert a job; `job.id` is ignored and the assigned id returned
    async fn insert_job(&mut self, job: &PipelineRunJob) -> StoreResult<i64>;

    async fn update_run(&mut self, run: &PipelineRun) -> StoreResult<()>;

    async fn update_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<()>;

    async fn update_job(&mut self, job: &PipelineRunJob) -> StoreResult<()>;

    /// Overwrite only the stage's custom params
    async fn update_stage_params(&mut self, stage_id: i64, custom_params: &Env)
    -> StoreResult<()>;

    /// Overwrite only the job's params
    async fn update_job_params(&mut self, job_id: i64, params: &Env) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Clamp a requested page size to 1..=100, defaulting to 20
pub fn page_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(20).clamp(1, 100)
}
