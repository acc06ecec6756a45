//! In-memory Run Store
//!
//! Keeps the tables in process. A transaction buffers its writes and applies
//! them in one step on commit; row locks are per-key async mutexes held by the
//! transaction until it commits or is dropped. A row lock is forgotten once no
//! transaction holds or waits on it. Ids come from one counter shared by all
//! tables and are not reused after a rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use relay_core::domain::env::Env;
use relay_core::domain::job::PipelineRunJob;
use relay_core::domain::log::JobRunLog;
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::PipelineRunStage;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{RunFilter, RunStore, RunTx, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct Tables {
    runs: BTreeMap<i64, PipelineRun>,
    stages: BTreeMap<i64, PipelineRunStage>,
    jobs: BTreeMap<i64, PipelineRunJob>,
    logs: BTreeMap<i64, JobRunLog>,
}

impl Tables {
    fn apply(&mut self, pending: Tables) {
        self.runs.extend(pending.runs);
        self.stages.extend(pending.stages);
        self.jobs.extend(pending.jobs);
        self.logs.extend(pending.logs);
    }
}

/// Lockable rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    /// "Last run of this pipeline", whether or not a run exists yet
    PipelineTail(i64),
    Stage(i64),
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: std::sync::Mutex<HashMap<RowKey, Arc<Mutex<()>>>>,
    next_id: AtomicI64,
}

impl Shared {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn row_lock(&self, key: RowKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    /// Drop the entries of `keys` that only the map still references
    fn prune_locks(&self, keys: impl IntoIterator<Item = RowKey>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks
                .get(&key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&key);
            }
        }
    }
}

/// Run store kept in process memory
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    shared: Arc<Shared>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transaction against a [`MemoryRunStore`]
pub struct MemoryRunTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    pending: Tables,
}

impl MemoryRunTx {
    async fn acquire(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = self.shared.row_lock(key);
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    async fn read_run(&self, id: i64) -> Option<PipelineRun> {
        if let Some(run) = self.pending.runs.get(&id) {
            return Some(run.clone());
        }
        self.shared.tables.lock().await.runs.get(&id).cloned()
    }

    async fn read_stage(&self, id: i64) -> Option<PipelineRunStage> {
        if let Some(stage) = self.pending.stages.get(&id) {
            return Some(stage.clone());
        }
        self.shared.tables.lock().await.stages.get(&id).cloned()
    }

    async fn read_job(&self, id: i64) -> Option<PipelineRunJob> {
        if let Some(job) = self.pending.jobs.get(&id) {
            return Some(job.clone());
        }
        self.shared.tables.lock().await.jobs.get(&id).cloned()
    }
}

impl Drop for MemoryRunTx {
    fn drop(&mut self) {
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        self.shared.prune_locks(keys);
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn begin(&self) -> StoreResult<Box<dyn RunTx>> {
        Ok(Box::new(MemoryRunTx {
            shared: self.shared.clone(),
            held: HashMap::new(),
            pending: Tables::default(),
        }))
    }

    async fn find_run(&self, id: i64) -> StoreResult<Option<PipelineRun>> {
        Ok(self.shared.tables.lock().await.runs.get(&id).cloned())
    }

    async fn last_run(&self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>> {
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .runs
            .values()
            .rev()
            .find(|r| r.pipeline_id == pipeline_id)
            .cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>> {
        let tables = self.shared.tables.lock().await;
        let limit = usize::try_from(filter.limit).unwrap_or(0);

        Ok(tables
            .runs
            .values()
            .rev()
            .filter(|r| r.pipeline_id == filter.pipeline_id)
            .filter(|r| {
                filter
                    .before_build_number
                    .is_none_or(|before| r.build_number < before)
            })
            .filter(|r| filter.status.is_none_or(|status| r.status == status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()> {
        let mut tables = self.shared.tables.lock().await;
        match tables.runs.get_mut(&run.id) {
            Some(row) => {
                *row = run.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("run", run.id)),
        }
    }

    async fn find_stage(&self, id: i64) -> StoreResult<Option<PipelineRunStage>> {
        Ok(self.shared.tables.lock().await.stages.get(&id).cloned())
    }

    async fn save_stage(&self, stage: &PipelineRunStage) -> StoreResult<()> {
        let mut tables = self.shared.tables.lock().await;
        match tables.stages.get_mut(&stage.id) {
            Some(row) => {
                *row = stage.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("stage", stage.id)),
        }
    }

    async fn stages_of_run(&self, run_id: i64) -> StoreResult<Vec<PipelineRunStage>> {
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .stages
            .values()
            .filter(|s| s.pipeline_run_id == run_id)
            .cloned()
            .collect())
    }

    async fn find_job(&self, id: i64) -> StoreResult<Option<PipelineRunJob>> {
        Ok(self.shared.tables.lock().await.jobs.get(&id).cloned())
    }

    async fn jobs_of_stage(&self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>> {
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.stage_run_id == stage_id)
            .cloned()
            .collect())
    }

    async fn last_job_log(
        &self,
        job_id: i64,
        with_content: bool,
    ) -> StoreResult<Option<JobRunLog>> {
        let tables = self.shared.tables.lock().await;
        Ok(tables
            .logs
            .values()
            .rev()
            .find(|l| l.job_run_id == job_id)
            .map(|log| {
                let mut log = log.clone();
                if !with_content {
                    log.content = None;
                }
                log
            }))
    }

    async fn insert_job_log(&self, job_id: i64, content: &str) -> StoreResult<JobRunLog> {
        let mut tables = self.shared.tables.lock().await;
        if !tables.jobs.contains_key(&job_id) {
            return Err(StoreError::not_found("job", job_id));
        }

        let now = Utc::now();
        let log = JobRunLog {
            id: self.shared.next_id(),
            job_run_id: job_id,
            content: Some(content.to_string()),
            created_at: now,
            updated_at: now,
        };
        tables.logs.insert(log.id, log.clone());
        Ok(log)
    }
}

#[async_trait]
impl RunTx for MemoryRunTx {
    async fn lock_last_run(&mut self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>> {
        self.acquire(RowKey::PipelineTail(pipeline_id)).await;

        let committed = {
            let tables = self.shared.tables.lock().await;
            tables
                .runs
                .values()
                .rev()
                .find(|r| r.pipeline_id == pipeline_id)
                .cloned()
        };
        let buffered = self
            .pending
            .runs
            .values()
            .rev()
            .find(|r| r.pipeline_id == pipeline_id)
            .cloned();

        Ok(match (committed, buffered) {
            (Some(a), Some(b)) => Some(if b.id > a.id { b } else { a }),
            (a, b) => a.or(b),
        })
    }

    async fn lock_stage(&mut self, id: i64) -> StoreResult<Option<PipelineRunStage>> {
        self.acquire(RowKey::Stage(id)).await;
        Ok(self.read_stage(id).await)
    }

    async fn find_run(&mut self, id: i64) -> StoreResult<Option<PipelineRun>> {
        Ok(self.read_run(id).await)
    }

    async fn find_job(&mut self, id: i64) -> StoreResult<Option<PipelineRunJob>> {
        Ok(self.read_job(id).await)
    }

    async fn jobs_of_stage(&mut self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>> {
        let mut jobs: BTreeMap<i64, PipelineRunJob> = {
            let tables = self.shared.tables.lock().await;
            tables
                .jobs
                .iter()
                .filter(|(_, j)| j.stage_run_id == stage_id)
                .map(|(id, j)| (*id, j.clone()))
                .collect()
        };
        jobs.extend(
            self.pending
                .jobs
                .iter()
                .filter(|(_, j)| j.stage_run_id == stage_id)
                .map(|(id, j)| (*id, j.clone())),
        );
        Ok(jobs.into_values().collect())
    }

    async fn insert_run(&mut self, run: &PipelineRun) -> StoreResult<i64> {
        let id = self.shared.next_id();
        let mut row = run.clone();
        row.id = id;
        self.pending.runs.insert(id, row);
        Ok(id)
    }

    async fn insert_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<i64> {
        if self.read_run(stage.pipeline_run_id).await.is_none() {
            return Err(StoreError::not_found("run", stage.pipeline_run_id));
        }
        let id = self.shared.next_id();
        let mut row = stage.clone();
        row.id = id;
        self.pending.stages.insert(id, row);
        Ok(id)
    }

    async fn insert_job(&mut self, job: &PipelineRunJob) -> StoreResult<i64> {
        if self.read_stage(job.stage_run_id).await.is_none() {
            return Err(StoreError::not_found("stage", job.stage_run_id));
        }
        let id = self.shared.next_id();
        let mut row = job.clone();
        row.id = id;
        self.pending.jobs.insert(id, row);
        Ok(id)
    }

    async fn update_run(&mut self, run: &PipelineRun) -> StoreResult<()> {
        if self.read_run(run.id).await.is_none() {
            return Err(StoreError::not_found("run", run.id));
        }
        self.pending.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<()> {
        if self.read_stage(stage.id).await.is_none() {
            return Err(StoreError::not_found("stage", stage.id));
        }
        self.pending.stages.insert(stage.id, stage.clone());
        Ok(())
    }

    async fn update_job(&mut self, job: &PipelineRunJob) -> StoreResult<()> {
        if self.read_job(job.id).await.is_none() {
            return Err(StoreError::not_found("job", job.id));
        }
        self.pending.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_stage_params(
        &mut self,
        stage_id: i64,
        custom_params: &Env,
    ) -> StoreResult<()> {
        let mut stage = self
            .read_stage(stage_id)
            .await
            .ok_or_else(|| StoreError::not_found("stage", stage_id))?;
        stage.custom_params = custom_params.clone();
        self.pending.stages.insert(stage_id, stage);
        Ok(())
    }

    async fn update_job_params(&mut self, job_id: i64, params: &Env) -> StoreResult<()> {
        let mut job = self
            .read_job(job_id)
            .await
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        job.params = params.clone();
        self.pending.jobs.insert(job_id, job);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let pending = std::mem::take(&mut self.pending);
        self.shared.tables.lock().await.apply(pending);
        // Row locks are released when `self` drops
        Ok(())
    }
}
