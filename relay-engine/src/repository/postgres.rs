//! PostgreSQL Run Store
//!
//! Row locks are `SELECT ... FOR UPDATE`. Build number allocation additionally
//! takes a transaction-scoped advisory lock on the pipeline id, so the first
//! run of a pipeline (no row to lock yet) is serialized too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::domain::env::Env;
use relay_core::domain::job::PipelineRunJob;
use relay_core::domain::log::JobRunLog;
use relay_core::domain::run::PipelineRun;
use relay_core::domain::stage::PipelineRunStage;
use relay_core::domain::status::Status;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};

use super::{RunFilter, RunStore, RunTx, StoreError, StoreResult};

/// Run store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Transaction on a pooled connection
pub struct PgRunTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn begin(&self) -> StoreResult<Box<dyn RunTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgRunTx { tx }))
    }

    async fn find_run(&self, id: i64) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, build_number, status, env, operator, created_at, updated_at
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn last_run(&self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, build_number, status, env, operator, created_at, updated_at
            FROM pipeline_runs
            WHERE pipeline_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> StoreResult<Vec<PipelineRun>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, build_number, status, env, operator, created_at, updated_at
            FROM pipeline_runs
            WHERE pipeline_id = $1
              AND ($2::BIGINT IS NULL OR build_number < $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY id DESC
            LIMIT $4
            "#,
        )
        .bind(filter.pipeline_id)
        .bind(filter.before_build_number)
        .bind(filter.status.map(Status::as_str))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn save_run(&self, run: &PipelineRun) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, env = $2, operator = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(run.status.as_str())
        .bind(Json(&run.env))
        .bind(&run.operator)
        .bind(run.updated_at)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("run", run.id));
        }
        Ok(())
    }

    async fn find_stage(&self, id: i64) -> StoreResult<Option<PipelineRunStage>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, pipeline_run_id, prev_stage_run_id, name, status, env, custom_params,
                   created_at, updated_at
            FROM pipeline_run_stages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn save_stage(&self, stage: &PipelineRunStage) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_run_stages
            SET status = $1, env = $2, custom_params = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(stage.status.as_str())
        .bind(Json(&stage.env))
        .bind(Json(&stage.custom_params))
        .bind(stage.updated_at)
        .bind(stage.id)
        .execute(&self.pool)
        .await?;

        ensure_updated(result.rows_affected(), "stage", stage.id)
    }

    async fn stages_of_run(&self, run_id: i64) -> StoreResult<Vec<PipelineRunStage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, pipeline_run_id, prev_stage_run_id, name, status, env, custom_params,
                   created_at, updated_at
            FROM pipeline_run_stages
            WHERE pipeline_run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn find_job(&self, id: i64) -> StoreResult<Option<PipelineRunJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, stage_run_id, name, status, env, params, created_at, updated_at
            FROM pipeline_run_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn jobs_of_stage(&self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, stage_run_id, name, status, env, params, created_at, updated_at
            FROM pipeline_run_jobs
            WHERE stage_run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn last_job_log(
        &self,
        job_id: i64,
        with_content: bool,
    ) -> StoreResult<Option<JobRunLog>> {
        let query = if with_content {
            r#"
            SELECT id, job_run_id, content, created_at, updated_at
            FROM pipeline_run_job_logs
            WHERE job_run_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#
        } else {
            r#"
            SELECT id, job_run_id, NULL::TEXT AS content, created_at, updated_at
            FROM pipeline_run_job_logs
            WHERE job_run_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#
        };

        let row = sqlx::query_as::<_, LogRow>(query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn insert_job_log(&self, job_id: i64, content: &str) -> StoreResult<JobRunLog> {
        let now = Utc::now();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_run_job_logs (job_run_id, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(content)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobRunLog {
            id,
            job_run_id: job_id,
            content: Some(content.to_string()),
            created_at: now,
            updated_at: now,
        })
    }
}

#[async_trait]
impl RunTx for PgRunTx {
    async fn lock_last_run(&mut self, pipeline_id: i64) -> StoreResult<Option<PipelineRun>> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(pipeline_id)
            .execute(&mut *self.tx)
            .await?;

        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, build_number, status, env, operator, created_at, updated_at
            FROM pipeline_runs
            WHERE pipeline_id = $1
            ORDER BY id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn lock_stage(&mut self, id: i64) -> StoreResult<Option<PipelineRunStage>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, pipeline_run_id, prev_stage_run_id, name, status, env, custom_params,
                   created_at, updated_at
            FROM pipeline_run_stages
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_run(&mut self, id: i64) -> StoreResult<Option<PipelineRun>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, pipeline_id, build_number, status, env, operator, created_at, updated_at
            FROM pipeline_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_job(&mut self, id: i64) -> StoreResult<Option<PipelineRunJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, stage_run_id, name, status, env, params, created_at, updated_at
            FROM pipeline_run_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn jobs_of_stage(&mut self, stage_id: i64) -> StoreResult<Vec<PipelineRunJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, stage_run_id, name, status, env, params, created_at, updated_at
            FROM pipeline_run_jobs
            WHERE stage_run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(stage_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn insert_run(&mut self, run: &PipelineRun) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_runs
                (pipeline_id, build_number, status, env, operator, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(run.pipeline_id)
        .bind(run.build_number)
        .bind(run.status.as_str())
        .bind(Json(&run.env))
        .bind(&run.operator)
        .bind(run.created_at)
        .bind(run.updated_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_run_stages
                (pipeline_run_id, prev_stage_run_id, name, status, env, custom_params,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(stage.pipeline_run_id)
        .bind(stage.prev_stage_run_id)
        .bind(&stage.name)
        .bind(stage.status.as_str())
        .bind(Json(&stage.env))
        .bind(Json(&stage.custom_params))
        .bind(stage.created_at)
        .bind(stage.updated_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn insert_job(&mut self, job: &PipelineRunJob) -> StoreResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_run_jobs
                (stage_run_id, name, status, env, params, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(job.stage_run_id)
        .bind(&job.name)
        .bind(job.status.as_str())
        .bind(Json(&job.env))
        .bind(Json(&job.params))
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn update_run(&mut self, run: &PipelineRun) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $1, env = $2, operator = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(run.status.as_str())
        .bind(Json(&run.env))
        .bind(&run.operator)
        .bind(run.updated_at)
        .bind(run.id)
        .execute(&mut *self.tx)
        .await?;

        ensure_updated(result.rows_affected(), "run", run.id)
    }

    async fn update_stage(&mut self, stage: &PipelineRunStage) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_run_stages
            SET status = $1, env = $2, custom_params = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(stage.status.as_str())
        .bind(Json(&stage.env))
        .bind(Json(&stage.custom_params))
        .bind(stage.updated_at)
        .bind(stage.id)
        .execute(&mut *self.tx)
        .await?;

        ensure_updated(result.rows_affected(), "stage", stage.id)
    }

    async fn update_job(&mut self, job: &PipelineRunJob) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_run_jobs
            SET status = $1, env = $2, params = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(job.status.as_str())
        .bind(Json(&job.env))
        .bind(Json(&job.params))
        .bind(job.updated_at)
        .bind(job.id)
        .execute(&mut *self.tx)
        .await?;

        ensure_updated(result.rows_affected(), "job", job.id)
    }

    async fn update_stage_params(
        &mut self,
        stage_id: i64,
        custom_params: &Env,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE pipeline_run_stages SET custom_params = $1 WHERE id = $2")
            .bind(Json(custom_params))
            .bind(stage_id)
            .execute(&mut *self.tx)
            .await?;

        ensure_updated(result.rows_affected(), "stage", stage_id)
    }

    async fn update_job_params(&mut self, job_id: i64, params: &Env) -> StoreResult<()> {
        let result = sqlx::query("UPDATE pipeline_run_jobs SET params = $1 WHERE id = $2")
            .bind(Json(params))
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;

        ensure_updated(result.rows_affected(), "job", job_id)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn ensure_updated(rows_affected: u64, entity: &'static str, id: i64) -> StoreResult<()> {
    if rows_affected == 0 {
        return Err(StoreError::not_found(entity, id));
    }
    Ok(())
}

fn string_to_status(s: &str) -> Status {
    match s {
        "Wait" => Status::Wait,
        "Doing" => Status::Doing,
        "OK" => Status::Ok,
        "Error" => Status::Error,
        "Pause" => Status::Pause,
        _ => Status::Wait,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    pipeline_id: i64,
    build_number: i64,
    status: String,
    env: Json<Env>,
    operator: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RunRow> for PipelineRun {
    fn from(row: RunRow) -> Self {
        PipelineRun {
            id: row.id,
            pipeline_id: row.pipeline_id,
            build_number: row.build_number,
            status: string_to_status(&row.status),
            env: row.env.0,
            operator: row.operator,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    pipeline_run_id: i64,
    prev_stage_run_id: i64,
    name: String,
    status: String,
    env: Json<Env>,
    custom_params: Json<Env>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StageRow> for PipelineRunStage {
    fn from(row: StageRow) -> Self {
        PipelineRunStage {
            id: row.id,
            pipeline_run_id: row.pipeline_run_id,
            prev_stage_run_id: row.prev_stage_run_id,
            name: row.name,
            status: string_to_status(&row.status),
            env: row.env.0,
            custom_params: row.custom_params.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    stage_run_id: i64,
    name: String,
    status: String,
    env: Json<Env>,
    params: Json<Env>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for PipelineRunJob {
    fn from(row: JobRow) -> Self {
        PipelineRunJob {
            id: row.id,
            stage_run_id: row.stage_run_id,
            name: row.name,
            status: string_to_status(&row.status),
            env: row.env.0,
            params: row.params.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    job_run_id: i64,
    content: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LogRow> for JobRunLog {
    fn from(row: LogRow) -> Self {
        JobRunLog {
            id: row.id,
            job_run_id: row.job_run_id,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
