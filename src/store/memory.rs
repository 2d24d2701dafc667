use async_trait::async_trait;
use serde_json::Value as JsonValue;

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use super::{JobStore, status_after_failure};
use crate::{
    JobId,
    entity::{Job, JobFailure, JobStatus, JobType, NewJob},
    error::JobError,
};

#[derive(Default)]
/// Process-local [`JobStore`] with the same transition rules as [`PgJobStore`](super::PgJobStore).
///
/// Every operation runs under a single lock, so it is only suitable for tests
/// and single-process embedding.
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<JobId, Job>>, JobError> {
        self.jobs
            .lock()
            .map_err(|_| JobError::Store("memory store lock poisoned".to_string()))
    }
}

fn transition(job: &mut Job, next: JobStatus) {
    debug_assert!(
        job.status.can_transition_to(next),
        "invalid transition {} -> {next}",
        job.status
    );
    job.status = next;
    job.updated_at = crate::time::now();
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, new_job: NewJob) -> Result<Job, JobError> {
        let now = crate::time::now();
        let job = Job {
            id: new_job.id,
            job_type: new_job.job_type,
            status: JobStatus::Scheduled,
            args: new_job.args,
            result: None,
            attempts: 0,
            owner_id: new_job.owner_id,
            run_at: new_job.run_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        };
        let mut jobs = self.lock()?;
        if jobs.contains_key(&job.id) {
            return Err(JobError::Store(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobError> {
        let now = crate::time::now();
        let mut jobs = self.lock()?;
        let next = jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Scheduled && job.run_at <= now)
            .min_by_key(|job| (job.run_at, job.id));
        Ok(next.map(|job| {
            transition(job, JobStatus::Running);
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn complete(&self, id: JobId, result: JsonValue) -> Result<bool, JobError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                transition(job, JobStatus::Completed);
                job.result = Some(result);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        failure: &JobFailure,
        max_attempts: u32,
    ) -> Result<Option<JobStatus>, JobError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                transition(job, status_after_failure(job.attempts, max_attempts));
                job.result = Some(failure.to_json());
                Ok(Some(job.status))
            }
            _ => Ok(None),
        }
    }

    async fn reclaim_stale(
        &self,
        timeout: Duration,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        let cutoff = crate::time::now() - crate::time::chrono_duration(timeout);
        let failure = JobFailure::timed_out().to_json();
        let mut jobs = self.lock()?;
        Ok(jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Running && job.updated_at < cutoff)
            .take(limit)
            .map(|job| {
                transition(job, status_after_failure(job.attempts, max_attempts));
                job.result = Some(failure.clone());
                job.clone()
            })
            .collect())
    }

    async fn count_scheduled(&self) -> Result<usize, JobError> {
        Ok(self
            .lock()?
            .values()
            .filter(|job| job.status == JobStatus::Scheduled)
            .count())
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn find_by_type_and_id(
        &self,
        job_type: &JobType,
        id: JobId,
    ) -> Result<Option<Job>, JobError> {
        Ok(self
            .lock()?
            .get(&id)
            .filter(|job| &job.job_type == job_type)
            .cloned())
    }

    async fn find_by_parent(
        &self,
        job_type: &JobType,
        parent: JobId,
    ) -> Result<Vec<Job>, JobError> {
        Ok(self
            .lock()?
            .values()
            .filter(|job| &job.job_type == job_type && job.parent_job() == Some(parent))
            .cloned()
            .collect())
    }

    async fn find_by_status_and_owner(
        &self,
        statuses: Option<&[JobStatus]>,
        owner_id: Option<&str>,
    ) -> Result<Vec<Job>, JobError> {
        if statuses.is_none() && owner_id.is_none() {
            return Err(JobError::InvalidSearch);
        }
        Ok(self
            .lock()?
            .values()
            .filter(|job| statuses.is_none_or(|s| s.contains(&job.status)))
            .filter(|job| owner_id.is_none_or(|o| job.owner_id == o))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    const TYPE: JobType = JobType::new("test");

    async fn insert(store: &MemoryJobStore) -> JobId {
        let new_job = NewJob::builder()
            .job_type(TYPE)
            .owner_id("user-1")
            .raw_args(serde_json::json!({}))
            .build()
            .unwrap();
        store.insert(new_job).await.unwrap().id
    }

    #[tokio::test]
    async fn claim_increments_attempts_once() {
        let store = MemoryJobStore::new();
        let id = insert(&store).await;

        let job = store.claim_next().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deferred_jobs_are_not_claimed_early() {
        let store = MemoryJobStore::new();
        let new_job = NewJob::builder()
            .job_type(TYPE)
            .owner_id("user-1")
            .raw_args(serde_json::json!({}))
            .run_at(crate::time::now() + chrono::Duration::hours(1))
            .build()
            .unwrap();
        store.insert(new_job).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
        assert_eq!(store.count_scheduled().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_completion_is_a_no_op() {
        let store = MemoryJobStore::new();
        let id = insert(&store).await;
        store.claim_next().await.unwrap();

        assert!(store.complete(id, serde_json::json!("first")).await.unwrap());
        assert!(!store.complete(id, serde_json::json!("second")).await.unwrap());
        let failure = JobFailure::new("late");
        assert_eq!(store.fail(id, &failure, 3).await.unwrap(), None);

        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!("first")));
    }

    #[tokio::test]
    async fn fail_retries_until_max_attempts() {
        let store = MemoryJobStore::new();
        let id = insert(&store).await;
        let failure = JobFailure::new("boom");

        for attempt in 1..=3u32 {
            let job = store.claim_next().await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);
            let status = store.fail(id, &failure, 3).await.unwrap();
            let expected = if attempt < 3 {
                JobStatus::Scheduled
            } else {
                JobStatus::Failed
            };
            assert_eq!(status, Some(expected));
        }

        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(failure.to_json()));
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_job_is_rescheduled_without_touching_attempts() {
        let store = MemoryJobStore::new();
        let id = insert(&store).await;
        store.claim_next().await.unwrap();
        {
            let mut jobs = store.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            job.updated_at = crate::time::now() - chrono::Duration::seconds(120);
        }

        let reclaimed = store
            .reclaim_stale(Duration::from_secs(60), 3, 100)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(JobFailure::timed_out().to_json()));
    }

    #[tokio::test]
    async fn stale_job_at_max_attempts_fails_as_timed_out() {
        let store = MemoryJobStore::new();
        let id = insert(&store).await;
        store.claim_next().await.unwrap();
        {
            let mut jobs = store.lock().unwrap();
            let job = jobs.get_mut(&id).unwrap();
            job.updated_at = crate::time::now() - chrono::Duration::seconds(120);
        }

        let reclaimed = store
            .reclaim_stale(Duration::from_secs(60), 1, 100)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Failed);

        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(serde_json::json!({ "error": "timed out" })));
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_running_jobs_are_left_alone() {
        let store = MemoryJobStore::new();
        insert(&store).await;
        store.claim_next().await.unwrap();

        let reclaimed = store
            .reclaim_stale(Duration::from_secs(60), 3, 100)
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..50 {
            insert(&store).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
    }

    #[tokio::test]
    async fn search_requires_a_filter() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.find_by_status_and_owner(None, None).await,
            Err(JobError::InvalidSearch)
        ));
    }
}
