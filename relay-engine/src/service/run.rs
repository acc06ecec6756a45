//! Run Service
//!
//! Lifecycle of pipeline runs: creation with build number allocation, stage
//! chain traversal, the stage update transaction that re-derives stage and run
//! status, and snapshot notification after each committed mutation.

use std::sync::Arc;

use chrono::Utc;
use relay_core::domain::chain::StageChain;
use relay_core::domain::env::{self, Env};
use relay_core::domain::job::PipelineRunJob;
use relay_core::domain::log::JobRunLog;
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::{PipelineRunStage, StageRunView};
use relay_core::domain::status::{self, Status};
use relay_core::dto::event::RunEvent;
use relay_core::dto::run::{CreateRun, ListRuns, UpdateRun};
use relay_core::dto::stage::{SaveStage, UpdateStage, UpdateStageParams};

use crate::notify::{Notifier, NotifyError};
use crate::repository::{RunFilter, RunStore, StoreError, page_limit};

/// Service error type
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{0}")]
    ValidationError(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => RunError::NotFound { entity, id },
            other => RunError::Store(other),
        }
    }
}

impl RunError {
    fn not_found(entity: &'static str, id: i64) -> Self {
        RunError::NotFound { entity, id }
    }
}

pub type Result<T> = std::result::Result<T, RunError>;

const MAX_LOG_CONTENT: usize = 1024 * 1024;

/// Pipeline run engine
pub struct RunService {
    store: Arc<dyn RunStore>,
    notifier: Arc<dyn Notifier>,
}

impl RunService {
    pub fn new(store: Arc<dyn RunStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a run with its stage chain and jobs in one transaction.
    ///
    /// The build number is the pipeline's last build number plus one, read
    /// under the pipeline lock, so concurrent creations for one pipeline get
    /// distinct consecutive numbers.
    pub async fn create_run(&self, req: CreateRun) -> Result<PipelineRun> {
        validate_create_run(&req)?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let last_build_number = tx
            .lock_last_run(req.pipeline_id)
            .await?
            .map(|run| run.build_number)
            .unwrap_or(0);
        let build_number = last_build_number + 1;

        let shadowed = env::reserved_keys_in(&req.env);
        if !shadowed.is_empty() {
            tracing::warn!(
                "Pipeline {} trigger env sets reserved keys {:?}, replaced by engine values",
                req.pipeline_id,
                shadowed
            );
        }

        let mut run = PipelineRun {
            id: 0,
            pipeline_id: req.pipeline_id,
            build_number,
            status: Status::Wait,
            env: req.env,
            operator: req.operator,
            created_at: now,
            updated_at: now,
        };
        run.stamp_reserved_env();
        run.id = tx.insert_run(&run).await?;

        let mut prev_stage_run_id = 0;
        for stage_req in req.stages {
            let stage = PipelineRunStage {
                id: 0,
                pipeline_run_id: run.id,
                prev_stage_run_id,
                name: stage_req.name,
                status: Status::Wait,
                env: Env::new(),
                custom_params: stage_req.custom_params,
                created_at: now,
                updated_at: now,
            };
            let stage_id = tx.insert_stage(&stage).await?;

            for job_req in stage_req.jobs {
                let job = PipelineRunJob {
                    id: 0,
                    stage_run_id: stage_id,
                    name: job_req.name,
                    status: Status::Wait,
                    env: Env::new(),
                    params: job_req.params,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_job(&job).await?;
            }

            prev_stage_run_id = stage_id;
        }

        tx.commit().await?;

        tracing::info!(
            "Run {} created for pipeline {} (build #{})",
            run.id,
            run.pipeline_id,
            run.build_number
        );

        self.stream_run(&run).await;

        Ok(run)
    }

    /// Get a run by ID
    pub async fn get_run(&self, id: i64) -> Result<PipelineRun> {
        self.store
            .find_run(id)
            .await?
            .ok_or_else(|| RunError::not_found("run", id))
    }

    /// Most recent run of a pipeline, if any
    pub async fn last_run(&self, pipeline_id: i64) -> Result<Option<PipelineRun>> {
        Ok(self.store.last_run(pipeline_id).await?)
    }

    /// List a pipeline's runs, newest first
    pub async fn list_runs(&self, pipeline_id: i64, query: ListRuns) -> Result<Vec<PipelineRun>> {
        let filter = RunFilter {
            pipeline_id,
            before_build_number: query.before_build_number.filter(|n| *n > 0),
            status: query.status,
            limit: page_limit(query.limit),
        };

        let runs = self.store.list_runs(&filter).await?;
        tracing::debug!("Listed {} runs for pipeline {}", runs.len(), pipeline_id);

        Ok(runs)
    }

    /// Save a run as given, bypassing stage derivation, then notify watchers
    pub async fn update_run(&self, mut run: PipelineRun) -> Result<PipelineRun> {
        if run.id == 0 {
            return Err(RunError::ValidationError(
                "Run id cannot be empty".to_string(),
            ));
        }

        run.updated_at = Utc::now();
        self.store.save_run(&run).await?;

        tracing::info!("Run {} updated with status {}", run.id, run.status);

        self.stream_run(&run).await;

        Ok(run)
    }

    /// Apply a run-level change (e.g. manual cancel) to a stored run.
    ///
    /// A replacement env gets the reserved keys stamped again from the run's
    /// build number and operator.
    pub async fn apply_run_update(&self, id: i64, update: UpdateRun) -> Result<PipelineRun> {
        let mut run = self.get_run(id).await?;

        if let Some(status) = update.status {
            run.status = status;
        }
        if let Some(run_env) = update.env {
            let mut changed: Vec<String> = run
                .reserved_env()
                .into_iter()
                .filter(|(key, value)| run_env.get(key) != Some(value))
                .map(|(key, _)| key)
                .collect();
            if !changed.is_empty() {
                changed.sort_unstable();
                tracing::warn!(
                    "Env update for run {} drops or changes reserved keys {:?}, restored",
                    run.id,
                    changed
                );
            }

            run.env = run_env;
            run.stamp_reserved_env();
        }

        self.update_run(run).await
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Get a stage with its jobs
    pub async fn get_stage(&self, id: i64) -> Result<StageRunView> {
        let stage = self
            .store
            .find_stage(id)
            .await?
            .ok_or_else(|| RunError::not_found("stage", id))?;

        self.with_jobs(stage).await
    }

    /// Jobs of a stage
    pub async fn stage_jobs(&self, stage_id: i64) -> Result<Vec<PipelineRunJob>> {
        Ok(self.store.jobs_of_stage(stage_id).await?)
    }

    /// Stage following `stage_id` in the run's chain, or the first stage when
    /// `stage_id` is 0; `None` at the end of the chain
    pub async fn next_stage(&self, run_id: i64, stage_id: i64) -> Result<Option<StageRunView>> {
        let chain = self.stage_chain(run_id).await?;
        let next = if stage_id == 0 {
            chain.first()
        } else {
            chain.next(stage_id)
        };

        match next.cloned() {
            Some(stage) => Ok(Some(self.with_jobs(stage).await?)),
            None => Ok(None),
        }
    }

    /// All stages of a run in chain order, with their jobs
    pub async fn ordered_stages(&self, run_id: i64) -> Result<Vec<StageRunView>> {
        let chain = self.stage_chain(run_id).await?;

        let mut views = Vec::with_capacity(chain.len());
        for stage in chain.into_stages() {
            views.push(self.with_jobs(stage).await?);
        }
        Ok(views)
    }

    /// Stages of a run rebuilt into chain order
    pub async fn stage_chain(&self, run_id: i64) -> Result<StageChain<PipelineRunStage>> {
        let stages = self.store.stages_of_run(run_id).await?;
        let chain = StageChain::from_unordered(stages);

        if !chain.orphaned().is_empty() {
            let ids: Vec<i64> = chain.orphaned().iter().map(|s| s.id).collect();
            tracing::warn!("Run {} has stages outside its chain: {:?}", run_id, ids);
        }

        Ok(chain)
    }

    /// Save a stage as given, bypassing job derivation, then notify watchers
    pub async fn update_stage(&self, mut stage: PipelineRunStage) -> Result<PipelineRunStage> {
        if stage.id == 0 {
            return Err(RunError::ValidationError(
                "Stage id cannot be empty".to_string(),
            ));
        }

        stage.updated_at = Utc::now();
        self.store.save_stage(&stage).await?;

        tracing::info!("Stage {} saved with status {}", stage.id, stage.status);

        match self.store.find_run(stage.pipeline_run_id).await {
            Ok(Some(run)) => self.stream_run(&run).await,
            Ok(None) => tracing::warn!(
                "Stage {} belongs to missing run {}",
                stage.id,
                stage.pipeline_run_id
            ),
            Err(err) => tracing::warn!("Failed to load run of stage {}: {}", stage.id, err),
        }

        Ok(stage)
    }

    /// Apply a direct change (status, seeded env) to a stored stage
    pub async fn apply_stage_save(&self, id: i64, save: SaveStage) -> Result<PipelineRunStage> {
        let mut stage = self
            .store
            .find_stage(id)
            .await?
            .ok_or_else(|| RunError::not_found("stage", id))?;

        if let Some(status) = save.status {
            stage.status = status;
        }
        if let Some(stage_env) = save.env {
            stage.env = stage_env;
        }

        self.update_stage(stage).await
    }

    /// Record job progress and/or set a stage status, then propagate it to the
    /// run, all in one transaction holding the stage lock.
    ///
    /// An explicit status is stored verbatim. Otherwise, when jobs were
    /// reported, the stage status and env are derived from the stage's jobs as
    /// they are after this update. Returns the saved run and stage.
    pub async fn update_stage_run(
        &self,
        req: UpdateStage,
    ) -> Result<(PipelineRun, PipelineRunStage)> {
        validate_update_stage(&req)?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let mut stage = tx
            .lock_stage(req.stage_id)
            .await?
            .ok_or_else(|| RunError::not_found("stage", req.stage_id))?;

        if let Some(updates) = &req.jobs {
            for update in updates {
                let mut job = tx
                    .find_job(update.id)
                    .await?
                    .ok_or_else(|| RunError::not_found("job", update.id))?;

                if job.stage_run_id != stage.id {
                    return Err(RunError::ValidationError(format!(
                        "Job {} does not belong to stage {}",
                        job.id, stage.id
                    )));
                }

                if let Some(status) = update.status {
                    job.status = status;
                }
                if let Some(job_env) = &update.env {
                    job.env = job_env.clone();
                }
                if let Some(params) = &update.params {
                    job.params = params.clone();
                }
                job.updated_at = now;

                tx.update_job(&job).await?;
            }
        }

        if let Some(status) = req.status {
            stage.status = status;
        } else if req.jobs.is_some() {
            let jobs = tx.jobs_of_stage(stage.id).await?;

            stage.status = status::derive_stage_status(jobs.iter().map(|j| j.status), stage.status);

            let produced = env::merge_stage_job_envs(jobs.iter().map(|j| &j.env));
            let shadowed = env::reserved_keys_in(&produced);
            if !shadowed.is_empty() {
                tracing::warn!(
                    "Jobs of stage {} overwrite reserved env keys {:?}",
                    stage.id,
                    shadowed
                );
            }
            stage.env = env::resolve_stage_env(&stage.env, &produced);
        }

        let mut run = tx
            .find_run(stage.pipeline_run_id)
            .await?
            .ok_or_else(|| RunError::not_found("run", stage.pipeline_run_id))?;

        if let Some(run_status) = status::derive_run_status(stage.status) {
            run.status = run_status;
        }

        stage.updated_at = now;
        run.updated_at = now;

        tx.update_stage(&stage).await?;
        tx.update_run(&run).await?;
        tx.commit().await?;

        tracing::info!(
            "Stage {} of run {} is {}, run is {}",
            stage.id,
            run.id,
            stage.status,
            run.status
        );

        self.stream_run(&run).await;

        Ok((run, stage))
    }

    /// Store operator overrides for a stage and its jobs in one transaction.
    ///
    /// Only `custom_params` / `params` are written; statuses are untouched and
    /// no snapshot is emitted.
    pub async fn update_stage_job_params(
        &self,
        stage_id: i64,
        req: UpdateStageParams,
    ) -> Result<()> {
        if stage_id == 0 {
            return Err(RunError::ValidationError(
                "Stage id cannot be empty".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;

        tx.lock_stage(stage_id)
            .await?
            .ok_or_else(|| RunError::not_found("stage", stage_id))?;
        tx.update_stage_params(stage_id, &req.custom_params).await?;

        for job_params in &req.jobs {
            let job = tx
                .find_job(job_params.id)
                .await?
                .ok_or_else(|| RunError::not_found("job", job_params.id))?;

            if job.stage_run_id != stage_id {
                return Err(RunError::ValidationError(format!(
                    "Job {} does not belong to stage {}",
                    job.id, stage_id
                )));
            }

            tx.update_job_params(job.id, &job_params.params).await?;
        }

        tx.commit().await?;

        tracing::info!("Params of stage {} updated", stage_id);

        Ok(())
    }

    /// Environment a stage's jobs start with.
    ///
    /// The first stage inherits the run env, later stages the env of the
    /// previous stage; the stage's custom params are laid on top.
    pub async fn env_before_stage(&self, stage_id: i64) -> Result<Env> {
        let stage = self
            .store
            .find_stage(stage_id)
            .await?
            .ok_or_else(|| RunError::not_found("stage", stage_id))?;

        let inherited = if stage.is_first() {
            self.store
                .find_run(stage.pipeline_run_id)
                .await?
                .ok_or_else(|| RunError::not_found("run", stage.pipeline_run_id))?
                .env
        } else {
            self.store
                .find_stage(stage.prev_stage_run_id)
                .await?
                .filter(|prev| prev.pipeline_run_id == stage.pipeline_run_id)
                .ok_or_else(|| RunError::not_found("stage", stage.prev_stage_run_id))?
                .env
        };

        let shadowed = env::reserved_keys_in(&stage.custom_params);
        if !shadowed.is_empty() {
            tracing::warn!(
                "Custom params of stage {} override reserved env keys {:?}",
                stage.id,
                shadowed
            );
        }

        Ok(env::env_before_stage(&inherited, &stage.custom_params))
    }

    // =========================================================================
    // Jobs and logs
    // =========================================================================

    /// Get a job by ID
    pub async fn get_job(&self, id: i64) -> Result<PipelineRunJob> {
        self.store
            .find_job(id)
            .await?
            .ok_or_else(|| RunError::not_found("job", id))
    }

    /// Most recent log record of a job; `None` until the job has logged.
    ///
    /// Without `with_log` only the record's ids and timestamps are read.
    /// An unknown job is a not-found error.
    pub async fn get_job_log(&self, job_id: i64, with_log: bool) -> Result<Option<JobRunLog>> {
        if job_id == 0 {
            return Err(RunError::ValidationError(
                "Job id cannot be empty".to_string(),
            ));
        }

        self.get_job(job_id).await?;
        Ok(self.store.last_job_log(job_id, with_log).await?)
    }

    /// Store log output reported by a job executor
    pub async fn append_job_log(&self, job_id: i64, content: &str) -> Result<JobRunLog> {
        if content.len() > MAX_LOG_CONTENT {
            return Err(RunError::ValidationError(format!(
                "Log content too long (max: {} bytes)",
                MAX_LOG_CONTENT
            )));
        }

        self.get_job(job_id).await?;
        let log = self.store.insert_job_log(job_id, content).await?;

        tracing::debug!("Stored log {} for job {}", log.id, job_id);

        Ok(log)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn with_jobs(&self, stage: PipelineRunStage) -> Result<StageRunView> {
        let jobs = self.store.jobs_of_stage(stage.id).await?;
        Ok(StageRunView { stage, jobs })
    }

    /// Send the run's current snapshot to watchers. Failures are logged only.
    async fn stream_run(&self, run: &PipelineRun) {
        if !self.notifier.has_watchers() {
            tracing::debug!("No watcher for run {}, snapshot skipped", run.id);
            return;
        }

        let result = match self.ordered_stages(run.id).await {
            Ok(stages) => self
                .notifier
                .notify(RunEvent::pipeline_run(run.clone(), stages)),
            Err(err) => Err(NotifyError::Snapshot(err.to_string())),
        };

        match result {
            Ok(()) => tracing::debug!("Snapshot of run {} sent", run.id),
            Err(NotifyError::NoSubscribers) => {
                tracing::debug!("No watcher for snapshot of run {}", run.id)
            }
            Err(err) => tracing::warn!("Failed to notify watchers of run {}: {}", run.id, err),
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_create_run(req: &CreateRun) -> Result<()> {
    if req.pipeline_id == 0 {
        return Err(RunError::ValidationError(
            "Pipeline id cannot be empty".to_string(),
        ));
    }

    if req.operator.trim().is_empty() {
        return Err(RunError::ValidationError(
            "Operator cannot be empty".to_string(),
        ));
    }

    if req.stages.is_empty() {
        return Err(RunError::ValidationError(
            "A run needs at least one stage".to_string(),
        ));
    }

    Ok(())
}

fn validate_update_stage(req: &UpdateStage) -> Result<()> {
    if req.stage_id == 0 {
        return Err(RunError::ValidationError(
            "Stage id cannot be empty".to_string(),
        ));
    }

    if let Some(jobs) = &req.jobs {
        if jobs.iter().any(|job| job.id == 0) {
            return Err(RunError::ValidationError(
                "Job id cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastNotifier;
    use crate::repository::MemoryRunStore;
    use relay_core::domain::env::{ENV_BUILD_NUMBER, ENV_TRIGGER_USER};
    use relay_core::dto::event::EVENT_TYPE_PIPELINE_RUN;
    use relay_core::dto::stage::{CreateJob, CreateStage, JobParams, JobUpdate};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<RunEvent>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<RunEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: RunEvent) -> std::result::Result<(), NotifyError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct BrokenNotifier;

    impl Notifier for BrokenNotifier {
        fn notify(&self, _event: RunEvent) -> std::result::Result<(), NotifyError> {
            Err(NotifyError::Snapshot("transport down".to_string()))
        }
    }

    fn service() -> (RunService, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let service = RunService::new(Arc::new(MemoryRunStore::new()), notifier.clone());
        (service, notifier)
    }

    fn stage(name: &str, jobs: &[&str]) -> CreateStage {
        CreateStage {
            name: name.to_string(),
            custom_params: Env::new(),
            jobs: jobs
                .iter()
                .map(|j| CreateJob {
                    name: j.to_string(),
                    params: Env::new(),
                })
                .collect(),
        }
    }

    fn create_request(pipeline_id: i64, stages: Vec<CreateStage>) -> CreateRun {
        CreateRun {
            pipeline_id,
            operator: "alice".to_string(),
            env: Env::from([("BRANCH".to_string(), json!("main"))]),
            stages,
        }
    }

    fn job_status(id: i64, status: Status) -> JobUpdate {
        JobUpdate {
            id,
            status: Some(status),
            env: None,
            params: None,
        }
    }

    /// Run with two stages: `build` (compile, lint) and `deploy` (ship)
    async fn two_stage_run(service: &RunService) -> (PipelineRun, Vec<StageRunView>) {
        let run = service
            .create_run(create_request(
                1,
                vec![
                    stage("build", &["compile", "lint"]),
                    stage("deploy", &["ship"]),
                ],
            ))
            .await
            .unwrap();
        let stages = service.ordered_stages(run.id).await.unwrap();
        (run, stages)
    }

    #[tokio::test]
    async fn test_create_run_builds_chain() {
        let (service, _) = service();
        let run = service
            .create_run(create_request(
                1,
                vec![stage("a", &["a1"]), stage("b", &[]), stage("c", &["c1", "c2"])],
            ))
            .await
            .unwrap();

        assert_eq!(run.build_number, 1);
        assert_eq!(run.status, Status::Wait);
        assert_eq!(run.env[ENV_BUILD_NUMBER], json!(1));
        assert_eq!(run.env[ENV_TRIGGER_USER], json!("alice"));
        assert_eq!(run.env["BRANCH"], json!("main"));

        let stages = service.ordered_stages(run.id).await.unwrap();
        let names: Vec<&str> = stages.iter().map(|s| s.stage.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(stages[0].stage.prev_stage_run_id, 0);
        assert_eq!(stages[1].stage.prev_stage_run_id, stages[0].stage.id);
        assert_eq!(stages[2].stage.prev_stage_run_id, stages[1].stage.id);
        assert_eq!(stages[2].jobs.len(), 2);
        assert!(stages[1].jobs.is_empty());
    }

    #[tokio::test]
    async fn test_create_run_validation() {
        let (service, notifier) = service();

        let err = service
            .create_run(create_request(1, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));

        let mut req = create_request(1, vec![stage("a", &[])]);
        req.operator = "  ".to_string();
        let err = service.create_run(req).await.unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));

        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_engine_stamps_reserved_env_keys() {
        let (service, _) = service();
        let mut req = create_request(3, vec![stage("a", &[])]);
        req.env
            .insert(ENV_BUILD_NUMBER.to_string(), json!("spoofed"));

        let run = service.create_run(req).await.unwrap();

        assert_eq!(run.env[ENV_BUILD_NUMBER], json!(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_allocates_consecutive_build_numbers() {
        let (service, _) = service();
        let service = Arc::new(service);
        const RUNS: i64 = 24;

        let mut handles = Vec::new();
        for i in 0..RUNS {
            let service = service.clone();
            // Interleave a second pipeline to check numbering is per pipeline
            let pipeline_id = if i % 3 == 0 { 8 } else { 7 };
            handles.push(tokio::spawn(async move {
                let run = service
                    .create_run(create_request(pipeline_id, vec![stage("only", &["job"])]))
                    .await
                    .unwrap();
                (run.pipeline_id, run.build_number)
            }));
        }

        let mut seven = Vec::new();
        let mut eight = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                (7, n) => seven.push(n),
                (_, n) => eight.push(n),
            }
        }
        seven.sort_unstable();
        eight.sort_unstable();

        assert_eq!(seven, (1..=seven.len() as i64).collect::<Vec<_>>());
        assert_eq!(eight, (1..=eight.len() as i64).collect::<Vec<_>>());
        assert_eq!(seven.len() + eight.len(), RUNS as usize);
    }

    #[tokio::test]
    async fn test_completing_first_stage_keeps_run_doing() {
        let (service, _) = service();
        let (run, stages) = two_stage_run(&service).await;
        let build = &stages[0];
        let deploy_before = stages[1].clone();

        let (updated_run, updated_stage) = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: None,
                jobs: Some(vec![
                    job_status(build.jobs[0].id, Status::Ok),
                    job_status(build.jobs[1].id, Status::Ok),
                ]),
            })
            .await
            .unwrap();

        assert_eq!(updated_stage.status, Status::Ok);
        assert_eq!(updated_run.id, run.id);
        assert_eq!(updated_run.status, Status::Doing);

        let deploy_after = service.get_stage(deploy_before.stage.id).await.unwrap();
        assert_eq!(deploy_after, deploy_before);
    }

    #[tokio::test]
    async fn test_error_job_fails_stage_and_run_in_any_order() {
        for statuses in [[Status::Ok, Status::Error], [Status::Error, Status::Ok]] {
            let (service, _) = service();
            let (_, stages) = two_stage_run(&service).await;
            let build = &stages[0];

            let (run, stage) = service
                .update_stage_run(UpdateStage {
                    stage_id: build.stage.id,
                    status: None,
                    jobs: Some(vec![
                        job_status(build.jobs[0].id, statuses[0]),
                        job_status(build.jobs[1].id, statuses[1]),
                    ]),
                })
                .await
                .unwrap();

            assert_eq!(stage.status, Status::Error);
            assert_eq!(run.status, Status::Error);
        }
    }

    #[tokio::test]
    async fn test_partial_completion_is_doing() {
        let (service, _) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];

        let (run, stage) = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: None,
                jobs: Some(vec![job_status(build.jobs[0].id, Status::Ok)]),
            })
            .await
            .unwrap();

        assert_eq!(stage.status, Status::Doing);
        assert_eq!(run.status, Status::Doing);
    }

    #[tokio::test]
    async fn test_repeated_update_is_idempotent() {
        let (service, _) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];
        let req = UpdateStage {
            stage_id: build.stage.id,
            status: None,
            jobs: Some(vec![
                job_status(build.jobs[0].id, Status::Ok),
                job_status(build.jobs[1].id, Status::Doing),
            ]),
        };

        let (run1, stage1) = service.update_stage_run(req.clone()).await.unwrap();
        let (run2, stage2) = service.update_stage_run(req).await.unwrap();

        assert_eq!(stage1.status, Status::Doing);
        assert_eq!(stage1.status, stage2.status);
        assert_eq!(run1.status, run2.status);
        assert_eq!(stage1.env, stage2.env);
    }

    #[tokio::test]
    async fn test_explicit_status_overrides_derivation() {
        let (service, _) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];

        let (run, stage) = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: Some(Status::Pause),
                jobs: Some(vec![job_status(build.jobs[0].id, Status::Ok)]),
            })
            .await
            .unwrap();

        assert_eq!(stage.status, Status::Pause);
        assert_eq!(run.status, Status::Pause);
        // Job progress is still recorded
        let job = service.get_job(build.jobs[0].id).await.unwrap();
        assert_eq!(job.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_explicit_wait_leaves_run_status() {
        let (service, _) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];

        service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: Some(Status::Doing),
                jobs: None,
            })
            .await
            .unwrap();
        let (run, stage) = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: Some(Status::Wait),
                jobs: None,
            })
            .await
            .unwrap();

        assert_eq!(stage.status, Status::Wait);
        assert_eq!(run.status, Status::Doing);
    }

    #[tokio::test]
    async fn test_job_env_flows_into_stage_and_next_stage() {
        let (service, _) = service();
        let mut deploy = stage("deploy", &["ship"]);
        deploy
            .custom_params
            .insert("IMAGE".to_string(), json!("override:1"));
        deploy
            .custom_params
            .insert("REGION".to_string(), json!("eu"));
        let run = service
            .create_run(create_request(1, vec![stage("build", &["compile"]), deploy]))
            .await
            .unwrap();
        let stages = service.ordered_stages(run.id).await.unwrap();
        let build = &stages[0];

        let (_, build_stage) = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: None,
                jobs: Some(vec![JobUpdate {
                    id: build.jobs[0].id,
                    status: Some(Status::Ok),
                    env: Some(Env::from([
                        ("IMAGE".to_string(), json!("app:42")),
                        ("DIGEST".to_string(), json!("sha256:abc")),
                    ])),
                    params: None,
                }]),
            })
            .await
            .unwrap();
        assert_eq!(build_stage.env["IMAGE"], json!("app:42"));

        let first_env = service.env_before_stage(build.stage.id).await.unwrap();
        assert_eq!(first_env["BRANCH"], json!("main"));
        assert_eq!(first_env[ENV_BUILD_NUMBER], json!(1));

        let deploy_env = service.env_before_stage(stages[1].stage.id).await.unwrap();
        assert_eq!(deploy_env["DIGEST"], json!("sha256:abc"));
        assert_eq!(deploy_env["IMAGE"], json!("override:1"));
        assert_eq!(deploy_env["REGION"], json!("eu"));
    }

    #[tokio::test]
    async fn test_seeded_stage_env_reaches_later_stages() {
        let (service, notifier) = service();
        let run = service
            .create_run(create_request(
                1,
                vec![
                    stage("build", &["compile"]),
                    stage("test", &["unit"]),
                    stage("deploy", &["ship"]),
                ],
            ))
            .await
            .unwrap();
        let stages = service.ordered_stages(run.id).await.unwrap();

        // Executor loop: seed the stage env, run the jobs, report them
        for (idx, view) in stages[..2].iter().enumerate() {
            let start_env = service.env_before_stage(view.stage.id).await.unwrap();
            let saved = service
                .apply_stage_save(
                    view.stage.id,
                    SaveStage {
                        status: Some(Status::Doing),
                        env: Some(start_env),
                    },
                )
                .await
                .unwrap();
            assert_eq!(saved.status, Status::Doing);

            let output = if idx == 0 {
                Some(Env::from([("DIGEST".to_string(), json!("sha256:abc"))]))
            } else {
                None
            };
            service
                .update_stage_run(UpdateStage {
                    stage_id: view.stage.id,
                    status: None,
                    jobs: Some(vec![JobUpdate {
                        id: view.jobs[0].id,
                        status: Some(Status::Ok),
                        env: output,
                        params: None,
                    }]),
                })
                .await
                .unwrap();
        }

        let deploy_env = service.env_before_stage(stages[2].stage.id).await.unwrap();
        assert_eq!(deploy_env[ENV_BUILD_NUMBER], json!(1));
        assert_eq!(deploy_env[ENV_TRIGGER_USER], json!("alice"));
        assert_eq!(deploy_env["BRANCH"], json!("main"));
        assert_eq!(deploy_env["DIGEST"], json!("sha256:abc"));

        // create + two saves + two reports
        assert_eq!(notifier.events().len(), 5);
    }

    #[tokio::test]
    async fn test_stage_save_validation_and_not_found() {
        let (service, notifier) = service();
        let (_, stages) = two_stage_run(&service).await;

        let mut stage = stages[0].stage.clone();
        stage.id = 0;
        let err = service.update_stage(stage).await.unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));

        let err = service
            .apply_stage_save(555, SaveStage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "stage", id: 555 }));

        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_update_validation_and_not_found() {
        let (service, notifier) = service();

        let err = service
            .update_stage_run(UpdateStage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));

        let err = service
            .update_stage_run(UpdateStage {
                stage_id: 999,
                status: Some(Status::Ok),
                jobs: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "stage", id: 999 }));

        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back_job_writes() {
        let (service, notifier) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];
        let foreign_job = stages[1].jobs[0].id;
        let events_before = notifier.events().len();

        let err = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: None,
                jobs: Some(vec![
                    job_status(build.jobs[0].id, Status::Ok),
                    job_status(foreign_job, Status::Ok),
                ]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));

        let err = service
            .update_stage_run(UpdateStage {
                stage_id: build.stage.id,
                status: None,
                jobs: Some(vec![
                    job_status(build.jobs[0].id, Status::Ok),
                    job_status(12345, Status::Ok),
                ]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "job", .. }));

        let job = service.get_job(build.jobs[0].id).await.unwrap();
        assert_eq!(job.status, Status::Wait);
        let stage = service.get_stage(build.stage.id).await.unwrap();
        assert_eq!(stage.stage.status, Status::Wait);
        assert_eq!(notifier.events().len(), events_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_job_reports_on_one_stage_are_serialized() {
        let (service, _) = service();
        let service = Arc::new(service);
        let (_, stages) = two_stage_run(&service).await;
        let stage_id = stages[0].stage.id;

        let handles: Vec<_> = stages[0]
            .jobs
            .iter()
            .map(|job| {
                let service = service.clone();
                let req = UpdateStage {
                    stage_id,
                    status: None,
                    jobs: Some(vec![job_status(job.id, Status::Ok)]),
                };
                tokio::spawn(async move { service.update_stage_run(req).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stage = service.get_stage(stage_id).await.unwrap();
        assert_eq!(stage.stage.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_snapshot_sent_after_update() {
        let (service, notifier) = service();
        let (run, stages) = two_stage_run(&service).await;

        service
            .update_stage_run(UpdateStage {
                stage_id: stages[0].stage.id,
                status: None,
                jobs: Some(vec![job_status(stages[0].jobs[0].id, Status::Doing)]),
            })
            .await
            .unwrap();

        let events = notifier.events();
        assert_eq!(events.len(), 2);
        let event = events.last().unwrap();
        assert_eq!(event.event_type, EVENT_TYPE_PIPELINE_RUN);
        assert_eq!(event.labels[EVENT_TYPE_PIPELINE_RUN], run.id.to_string());
        assert_eq!(event.labels["pipeline"], "1");
        assert_eq!(event.run.status, Status::Doing);
        let ids: Vec<i64> = event.stages.iter().map(|s| s.stage.id).collect();
        assert_eq!(ids, vec![stages[0].stage.id, stages[1].stage.id]);
        assert_eq!(event.stages[0].stage.status, Status::Doing);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_mutation() {
        let store = Arc::new(MemoryRunStore::new());
        let service = RunService::new(store.clone(), Arc::new(BrokenNotifier));
        let (_, stages) = two_stage_run(&service).await;

        let (_, stage) = service
            .update_stage_run(UpdateStage {
                stage_id: stages[0].stage.id,
                status: Some(Status::Error),
                jobs: None,
            })
            .await
            .unwrap();
        assert_eq!(stage.status, Status::Error);

        let quiet = RunService::new(store, Arc::new(BroadcastNotifier::new(8)));
        let run = quiet.get_run(stage.pipeline_run_id).await.unwrap();
        assert_eq!(run.status, Status::Error);
        quiet
            .apply_run_update(run.id, UpdateRun::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_next_stage_traversal() {
        let (service, _) = service();
        let (run, stages) = two_stage_run(&service).await;

        let next = service
            .next_stage(run.id, stages[0].stage.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.stage.id, stages[1].stage.id);
        assert_eq!(next.jobs.len(), 1);

        let first = service.next_stage(run.id, 0).await.unwrap().unwrap();
        assert_eq!(first.stage.id, stages[0].stage.id);

        assert!(
            service
                .next_stage(run.id, stages[1].stage.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_update_run_bypasses_stages() {
        let (service, notifier) = service();
        let (run, stages) = two_stage_run(&service).await;

        let updated = service
            .apply_run_update(
                run.id,
                UpdateRun {
                    status: Some(Status::Error),
                    env: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, Status::Error);
        assert!(updated.updated_at >= run.updated_at);
        assert_eq!(service.get_run(run.id).await.unwrap().status, Status::Error);
        let stage = service.get_stage(stages[0].stage.id).await.unwrap();
        assert_eq!(stage.stage.status, Status::Wait);
        assert_eq!(notifier.events().last().unwrap().run.status, Status::Error);

        let err = service
            .apply_run_update(404, UpdateRun::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "run", id: 404 }));
    }

    #[tokio::test]
    async fn test_run_env_replacement_keeps_reserved_keys() {
        let (service, _) = service();
        let (run, _) = two_stage_run(&service).await;

        let updated = service
            .apply_run_update(
                run.id,
                UpdateRun {
                    status: None,
                    env: Some(Env::from([
                        ("BRANCH".to_string(), json!("release")),
                        (ENV_TRIGGER_USER.to_string(), json!("mallory")),
                    ])),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.env["BRANCH"], json!("release"));
        assert_eq!(updated.env[ENV_BUILD_NUMBER], json!(1));
        assert_eq!(updated.env[ENV_TRIGGER_USER], json!("alice"));
        let stored = service.get_run(run.id).await.unwrap();
        assert_eq!(stored.env, updated.env);
    }

    #[tokio::test]
    async fn test_snapshot_skipped_without_watchers() {
        let notifier = Arc::new(BroadcastNotifier::new(8));
        let service = RunService::new(Arc::new(MemoryRunStore::new()), notifier.clone());
        two_stage_run(&service).await;

        let mut rx = notifier.subscribe();
        let (run, _) = two_stage_run(&service).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), run.id);
        assert_eq!(event.stages.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_runs_pages_backwards() {
        let (service, _) = service();
        for _ in 0..3 {
            service
                .create_run(create_request(4, vec![stage("a", &["j"])]))
                .await
                .unwrap();
        }
        service
            .create_run(create_request(5, vec![stage("a", &["j"])]))
            .await
            .unwrap();

        let all = service.list_runs(4, ListRuns::default()).await.unwrap();
        let numbers: Vec<i64> = all.iter().map(|r| r.build_number).collect();
        assert_eq!(numbers, vec![3, 2, 1]);

        let older = service
            .list_runs(
                4,
                ListRuns {
                    before_build_number: Some(3),
                    status: None,
                    limit: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].build_number, 2);

        let failed = service
            .list_runs(
                4,
                ListRuns {
                    before_build_number: None,
                    status: Some(Status::Error),
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert!(failed.is_empty());

        let last = service.last_run(4).await.unwrap().unwrap();
        assert_eq!(last.build_number, 3);
        assert!(service.last_run(6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_job_params_update() {
        let (service, notifier) = service();
        let (_, stages) = two_stage_run(&service).await;
        let build = &stages[0];
        let events_before = notifier.events().len();

        service
            .update_stage_job_params(
                build.stage.id,
                UpdateStageParams {
                    custom_params: Env::from([("RETRIES".to_string(), json!(3))]),
                    jobs: vec![JobParams {
                        id: build.jobs[1].id,
                        params: Env::from([("STRICT".to_string(), json!(true))]),
                    }],
                },
            )
            .await
            .unwrap();

        let stage = service.get_stage(build.stage.id).await.unwrap();
        assert_eq!(stage.stage.custom_params["RETRIES"], json!(3));
        assert_eq!(stage.stage.status, Status::Wait);
        assert_eq!(stage.jobs[1].params["STRICT"], json!(true));
        assert!(stage.jobs[0].params.is_empty());
        assert_eq!(notifier.events().len(), events_before);

        let err = service
            .update_stage_job_params(
                build.stage.id,
                UpdateStageParams {
                    custom_params: Env::new(),
                    jobs: vec![JobParams {
                        id: stages[1].jobs[0].id,
                        params: Env::new(),
                    }],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::ValidationError(_)));
        let stage = service.get_stage(build.stage.id).await.unwrap();
        assert_eq!(stage.stage.custom_params["RETRIES"], json!(3));
    }

    #[tokio::test]
    async fn test_job_log_lookup() {
        let (service, _) = service();
        let (_, stages) = two_stage_run(&service).await;
        let job_id = stages[0].jobs[0].id;

        assert!(service.get_job_log(job_id, true).await.unwrap().is_none());

        service.append_job_log(job_id, "compiling").await.unwrap();
        service.append_job_log(job_id, "done").await.unwrap();

        let full = service.get_job_log(job_id, true).await.unwrap().unwrap();
        assert_eq!(full.content.as_deref(), Some("done"));
        let meta = service.get_job_log(job_id, false).await.unwrap().unwrap();
        assert_eq!(meta.id, full.id);
        assert!(meta.content.is_none());

        let err = service.append_job_log(777, "x").await.unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "job", id: 777 }));
        let err = service.get_job_log(777, true).await.unwrap_err();
        assert!(matches!(err, RunError::NotFound { entity: "job", id: 777 }));
        assert!(matches!(
            service.get_job_log(0, true).await,
            Err(RunError::ValidationError(_))
        ));
    }
}
