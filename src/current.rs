//! Execution-time context handed to running jobs.

use serde::de::DeserializeOwned;

use super::{
    JobId,
    entity::{Job, JobType},
};

/// Context provided to a [`JobHandler`](crate::JobHandler) while a job is executing.
pub struct CurrentJob {
    job: Job,
}

impl CurrentJob {
    pub(super) fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Attempt number of this execution, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    pub fn owner_id(&self) -> &str {
        &self.job.owner_id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job.job_type
    }

    pub(crate) fn args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.job.args()
    }

    /// The full job row as claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }
}
