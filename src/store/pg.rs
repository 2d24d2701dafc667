use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{Span, instrument};
use uuid::Uuid;

use std::time::Duration;

use super::JobStore;
use crate::{
    JobId,
    entity::{Job, JobFailure, JobStatus, JobType, NewJob},
    error::JobError,
};

const JOB_COLUMNS: &str =
    "id, job_type, status, args, result, attempts, owner_id, run_at, created_at, updated_at";

#[derive(Clone)]
/// [`JobStore`] backed by the `jobs` table in Postgres.
///
/// Claim and reclaim lock candidate rows with `FOR UPDATE SKIP LOCKED`, so any
/// number of processes can poll the same table.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    status: JobStatus,
    args: JsonValue,
    result: Option<JsonValue>,
    attempts: i32,
    owner_id: String,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::from(row.id),
            job_type: JobType::from_owned(row.job_type),
            status: row.status,
            args: row.args,
            result: row.result,
            attempts: row.attempts.max(0) as u32,
            owner_id: row.owner_id,
            run_at: row.run_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter().map(Job::from).collect()
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    status: JobStatus,
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(name = "job.store.insert", skip_all, fields(job_id = %new_job.id, job_type = %new_job.job_type), err)]
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobError> {
        let sql = format!(
            r#"
            INSERT INTO jobs (id, job_type, status, args, attempts, owner_id, run_at, created_at, updated_at)
            VALUES ($1, $2, 'scheduled', $3, 0, $4, COALESCE($5, NOW()), NOW(), NOW())
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: JobRow = sqlx::query_as(&sql)
            .bind(new_job.id)
            .bind(new_job.job_type.as_str())
            .bind(&new_job.args)
            .bind(&new_job.owner_id)
            .bind(new_job.run_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    #[instrument(name = "job.store.claim_next", level = "debug", skip(self), fields(job_id = tracing::field::Empty), err)]
    async fn claim_next(&self) -> Result<Option<Job>, JobError> {
        let sql = format!(
            r#"
            WITH to_run AS (
                SELECT id FROM jobs
                WHERE status = 'scheduled' AND run_at <= NOW()
                ORDER BY run_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = 'running', updated_at = NOW(), attempts = j.attempts + 1
            FROM to_run
            WHERE j.id = to_run.id
            RETURNING {}
            "#,
            qualified_columns("j")
        );
        let row: Option<JobRow> = sqlx::query_as(&sql).fetch_optional(&self.pool).await?;
        if let Some(row) = &row {
            Span::current().record("job_id", tracing::field::display(row.id));
        }
        Ok(row.map(Job::from))
    }

    #[instrument(name = "job.store.complete", skip(self, result), err)]
    async fn complete(&self, id: JobId, result: JsonValue) -> Result<bool, JobError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', updated_at = NOW(), result = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    #[instrument(name = "job.store.fail", skip(self, failure), fields(error = %failure), err)]
    async fn fail(
        &self,
        id: JobId,
        failure: &JobFailure,
        max_attempts: u32,
    ) -> Result<Option<JobStatus>, JobError> {
        let row: Option<StatusRow> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= $3 THEN 'failed'::job_status ELSE 'scheduled'::job_status END,
                updated_at = NOW(),
                result = $2
            WHERE id = $1 AND status = 'running'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(failure.to_json())
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.status))
    }

    #[instrument(name = "job.store.reclaim_stale", level = "debug", skip(self), fields(n_reclaimed = tracing::field::Empty), err)]
    async fn reclaim_stale(
        &self,
        timeout: Duration,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            r#"
            WITH stale AS (
                SELECT id FROM jobs
                WHERE status = 'running' AND updated_at < NOW() - make_interval(secs => $3)
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = CASE WHEN j.attempts >= $2 THEN 'failed'::job_status ELSE 'scheduled'::job_status END,
                updated_at = NOW(),
                result = $1
            FROM stale
            WHERE j.id = stale.id
            RETURNING {}
            "#,
            qualified_columns("j")
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(JobFailure::timed_out().to_json())
            .bind(max_attempts as i32)
            .bind(timeout.as_secs_f64())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Span::current().record("n_reclaimed", rows.len());
        Ok(into_jobs(rows))
    }

    #[instrument(name = "job.store.count_scheduled", level = "debug", skip(self), err)]
    async fn count_scheduled(&self) -> Result<usize, JobError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'scheduled'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    #[instrument(name = "job.store.find_by_id", level = "debug", skip(self), err)]
    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Job::from))
    }

    #[instrument(name = "job.store.find_by_type_and_id", level = "debug", skip(self), err)]
    async fn find_by_type_and_id(
        &self,
        job_type: &JobType,
        id: JobId,
    ) -> Result<Option<Job>, JobError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND job_type = $2");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(job_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Job::from))
    }

    #[instrument(name = "job.store.find_by_parent", level = "debug", skip(self), err)]
    async fn find_by_parent(
        &self,
        job_type: &JobType,
        parent: JobId,
    ) -> Result<Vec<Job>, JobError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE args->>'parentJob' = $1 AND job_type = $2 ORDER BY id"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(parent.to_string())
            .bind(job_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(into_jobs(rows))
    }

    #[instrument(name = "job.store.find_by_status_and_owner", level = "debug", skip(self), err)]
    async fn find_by_status_and_owner(
        &self,
        statuses: Option<&[JobStatus]>,
        owner_id: Option<&str>,
    ) -> Result<Vec<Job>, JobError> {
        let rows: Vec<JobRow> = match (statuses, owner_id) {
            (None, None) => return Err(JobError::InvalidSearch),
            (Some(statuses), Some(owner_id)) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = $1 AND status = ANY($2) ORDER BY id"
                );
                sqlx::query_as(&sql)
                    .bind(owner_id)
                    .bind(statuses.to_vec())
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, Some(owner_id)) => {
                let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = $1 ORDER BY id");
                sqlx::query_as(&sql)
                    .bind(owner_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(statuses), None) => {
                let sql =
                    format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ANY($1) ORDER BY id");
                sqlx::query_as(&sql)
                    .bind(statuses.to_vec())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(into_jobs(rows))
    }
}

fn qualified_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}
