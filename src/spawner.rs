//! Job spawner for creating jobs of a specific type.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use std::{marker::PhantomData, sync::Arc};

use super::{
    JobId,
    entity::{JobType, NewJob},
    error::JobError,
    store::JobStore,
    tracker::ScheduleSignal,
};

/// A handle for spawning jobs of a specific type.
///
/// Returned by [`crate::Jobs::add_handler`]. The spawner encapsulates the job type
/// and provides type-safe job creation methods.
///
/// # Examples
///
/// ```ignore
/// let spawner = jobs.add_handler(MyHandler);
/// let job_id = spawner.spawn("user-1", MyArgs { value: 42 }).await?;
/// ```
pub struct JobSpawner<Args> {
    store: Arc<dyn JobStore>,
    job_type: JobType,
    signal: ScheduleSignal,
    _phantom: PhantomData<fn(Args)>,
}

impl<Args> Clone for JobSpawner<Args> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            job_type: self.job_type.clone(),
            signal: self.signal.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<Args> JobSpawner<Args>
where
    Args: Serialize + Send + Sync,
{
    pub(crate) fn new(store: Arc<dyn JobStore>, job_type: JobType, signal: ScheduleSignal) -> Self {
        Self {
            store,
            job_type,
            signal,
            _phantom: PhantomData,
        }
    }

    /// Returns the job type this spawner creates.
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// Create a job for immediate execution. Returns as soon as the row is
    /// inserted, before the job runs.
    #[instrument(
        name = "job_spawner.spawn",
        skip(self, args),
        fields(job_type = %self.job_type),
        err
    )]
    pub async fn spawn(&self, owner_id: &str, args: Args) -> Result<JobId, JobError> {
        let new_job = NewJob::builder()
            .job_type(self.job_type.clone())
            .owner_id(owner_id)
            .args(args)?
            .build()?;
        insert_job(self.store.as_ref(), &self.signal, new_job).await
    }

    /// Create a job that becomes eligible at `run_at`.
    #[instrument(
        name = "job_spawner.spawn_at",
        skip(self, args),
        fields(job_type = %self.job_type),
        err
    )]
    pub async fn spawn_at(
        &self,
        owner_id: &str,
        args: Args,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, JobError> {
        let new_job = NewJob::builder()
            .job_type(self.job_type.clone())
            .owner_id(owner_id)
            .args(args)?
            .run_at(run_at)
            .build()?;
        insert_job(self.store.as_ref(), &self.signal, new_job).await
    }
}

/// Insert the row and nudge the scheduler.
pub(crate) async fn insert_job(
    store: &dyn JobStore,
    signal: &ScheduleSignal,
    new_job: NewJob,
) -> Result<JobId, JobError> {
    let job = store.insert(new_job).await?;
    signal.job_inserted();
    Ok(job.id)
}
