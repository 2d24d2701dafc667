use tracing::{Span, instrument};

use std::sync::Arc;

use super::{
    JobId,
    current::CurrentJob,
    entity::{JobFailure, JobStatus},
    error::JobError,
    registry::JobRegistry,
    store::JobStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened during one claim-and-execute cycle.
pub(crate) enum DispatchOutcome {
    /// Nothing was eligible to claim.
    Idle,
    Completed(JobId),
    /// The job failed; carries the status it was moved to, if it was still running.
    Failed(JobId, Option<JobStatus>),
}

/// Claims one job and runs it to a recorded outcome.
pub(crate) struct JobDispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    max_attempts: u32,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>, max_attempts: u32) -> Self {
        Self {
            store,
            registry,
            max_attempts,
        }
    }

    #[instrument(name = "job.execute_job", skip_all,
        fields(job_id, job_type, attempt, error, error.message, conclusion),
    err)]
    pub async fn execute_next(&self) -> Result<DispatchOutcome, JobError> {
        let Some(job) = self.store.claim_next().await? else {
            Span::current().record("conclusion", "Idle");
            return Ok(DispatchOutcome::Idle);
        };
        let span = Span::current();
        let id = job.id;
        span.record("job_id", tracing::field::display(id));
        span.record("job_type", tracing::field::display(&job.job_type));
        span.record("attempt", job.attempts);

        let Some(handler) = self.registry.handler(&job.job_type) else {
            tracing::error!(job_id = %id, job_type = %job.job_type, "No job handler registered");
            span.record("conclusion", "NoHandler");
            let status = self.fail_job(id, JobFailure::no_handler()).await?;
            return Ok(DispatchOutcome::Failed(id, status));
        };

        match handler.execute(CurrentJob::new(job)).await {
            Ok(result) => {
                span.record("conclusion", "Complete");
                if !self.store.complete(id, result).await? {
                    tracing::warn!(job_id = %id, "job was no longer running when it completed");
                }
                Ok(DispatchOutcome::Completed(id))
            }
            Err(failure) => {
                span.record("conclusion", "Error");
                span.record("error", true);
                span.record("error.message", tracing::field::display(&failure));
                let status = self.fail_job(id, failure).await?;
                Ok(DispatchOutcome::Failed(id, status))
            }
        }
    }

    #[instrument(name = "job.fail_job", skip(self, failure), fields(will_retry = tracing::field::Empty))]
    async fn fail_job(&self, id: JobId, failure: JobFailure) -> Result<Option<JobStatus>, JobError> {
        let status = self.store.fail(id, &failure, self.max_attempts).await?;
        match status {
            Some(JobStatus::Scheduled) => {
                Span::current().record("will_retry", true);
                tracing::warn!(job_id = %id, error = %failure, "job failed, will retry");
            }
            Some(_) => {
                Span::current().record("will_retry", false);
                tracing::error!(job_id = %id, error = %failure, "job failed permanently");
            }
            None => {
                tracing::warn!(job_id = %id, "job was no longer running when it failed");
            }
        }
        Ok(status)
    }
}
