//! Durable job storage.
//!
//! Every operation applies atomically or not at all. Mutual exclusion between
//! runners, whether in this process or another one, comes solely from
//! [`JobStore::claim_next`].

mod memory;
mod pg;

use async_trait::async_trait;

use std::time::Duration;

use crate::{
    JobId,
    entity::{Job, JobFailure, JobStatus, JobType, NewJob},
    error::JobError,
};

pub use memory::MemoryJobStore;
pub use pg::PgJobStore;

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Append a new row with `status = scheduled` and `attempts = 0`.
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobError>;

    /// Claim one eligible scheduled job, moving it to `running` and bumping
    /// `attempts`. Returns `None` without blocking when nothing is eligible.
    async fn claim_next(&self) -> Result<Option<Job>, JobError>;

    /// `running -> completed`. Returns `false` when the job was no longer running.
    async fn complete(&self, id: JobId, result: serde_json::Value) -> Result<bool, JobError>;

    /// `running -> failed` once `attempts >= max_attempts`, otherwise back to
    /// `scheduled`. Returns the new status, or `None` if the job was not running.
    async fn fail(
        &self,
        id: JobId,
        failure: &JobFailure,
        max_attempts: u32,
    ) -> Result<Option<JobStatus>, JobError>;

    /// Apply the fail-or-retry transition to at most `limit` jobs that have
    /// been running without an update for longer than `timeout`.
    async fn reclaim_stale(
        &self,
        timeout: Duration,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Job>, JobError>;

    async fn count_scheduled(&self) -> Result<usize, JobError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError>;

    async fn find_by_type_and_id(
        &self,
        job_type: &JobType,
        id: JobId,
    ) -> Result<Option<Job>, JobError>;

    /// Jobs of `job_type` whose arguments reference `parent` as their parent job.
    async fn find_by_parent(&self, job_type: &JobType, parent: JobId)
    -> Result<Vec<Job>, JobError>;

    /// Jobs matching every supplied filter. At least one filter must be given.
    async fn find_by_status_and_owner(
        &self,
        statuses: Option<&[JobStatus]>,
        owner_id: Option<&str>,
    ) -> Result<Vec<Job>, JobError>;
}

pub(crate) fn status_after_failure(attempts: u32, max_attempts: u32) -> JobStatus {
    if attempts >= max_attempts {
        JobStatus::Failed
    } else {
        JobStatus::Scheduled
    }
}
