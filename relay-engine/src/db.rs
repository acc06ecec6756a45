use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::config::Config;

pub async fn create_pool(database_url: &str, config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL,
            build_number BIGINT NOT NULL,
            status VARCHAR(20) NOT NULL,
            env JSONB NOT NULL DEFAULT '{}',
            operator VARCHAR(255) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create stages table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_run_stages (
            id BIGSERIAL PRIMARY KEY,
            pipeline_run_id BIGINT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
            prev_stage_run_id BIGINT NOT NULL DEFAULT 0,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            env JSONB NOT NULL DEFAULT '{}',
            custom_params JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_run_jobs (
            id BIGSERIAL PRIMARY KEY,
            stage_run_id BIGINT NOT NULL REFERENCES pipeline_run_stages(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            status VARCHAR(20) NOT NULL,
            env JSONB NOT NULL DEFAULT '{}',
            params JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job logs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_run_job_logs (
            id BIGSERIAL PRIMARY KEY,
            job_run_id BIGINT NOT NULL REFERENCES pipeline_run_jobs(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Build numbers are unique per pipeline
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_pipeline_runs_build \
         ON pipeline_runs(pipeline_id, build_number)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_run_stages_run ON pipeline_run_stages(pipeline_run_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_run_jobs_stage ON pipeline_run_jobs(stage_run_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_logs_job ON pipeline_run_job_logs(job_run_id, id)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
