use tokio::time::MissedTickBehavior;
use tracing::{Span, instrument};

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use super::{
    config::JobPollerConfig,
    dispatcher::*,
    error::JobError,
    gate::{ConcurrencyGate, Reservation},
    handle::OwnedTaskHandle,
    registry::JobRegistry,
    store::JobStore,
    tracker::ScheduleSignal,
};

pub(crate) struct JobPoller {
    config: JobPollerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    gate: ConcurrencyGate,
    signal: ScheduleSignal,
    last_job_count: AtomicUsize,
    draining: AtomicBool,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub(crate) struct JobPollerHandle {
    poller: Arc<JobPoller>,
    handle: std::sync::Mutex<Option<OwnedTaskHandle>>,
    reaper: std::sync::Mutex<Option<OwnedTaskHandle>>,
    shutdown_called: AtomicBool,
}

/// Number of run-one-job tasks to admit in one evaluation.
///
/// The backlog is capped at `max_queue_size`; only tasks still waiting for a
/// gate permit count against it, since running tasks are already serviced.
pub(crate) fn admission_count(db_queue_size: usize, max_queue_size: usize, queued: usize) -> usize {
    db_queue_size.min(max_queue_size).saturating_sub(queued)
}

impl JobPoller {
    pub fn new(
        config: JobPollerConfig,
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        signal: ScheduleSignal,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        Self {
            gate: ConcurrencyGate::new(config.max_concurrent_jobs),
            store,
            registry: Arc::new(registry),
            signal,
            config,
            last_job_count: AtomicUsize::new(1),
            draining: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn start(self) -> JobPollerHandle {
        tracing::info!(
            job_types = ?self.registry.registered_job_types(),
            max_concurrent_jobs = self.config.max_concurrent_jobs.get(),
            "starting job poller"
        );
        let poller = Arc::new(self);
        let reaper = OwnedTaskHandle::new(tokio::task::spawn(Self::reaper_loop(Arc::clone(
            &poller,
        ))));
        let handle = OwnedTaskHandle::new(tokio::task::spawn(Self::main_loop(Arc::clone(
            &poller,
        ))));
        JobPollerHandle {
            poller,
            handle: std::sync::Mutex::new(Some(handle)),
            reaper: std::sync::Mutex::new(Some(reaper)),
            shutdown_called: AtomicBool::new(false),
        }
    }

    async fn main_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.scheduling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,
                _ = self.signal.notified() => {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.recv() => break,
                        _ = crate::time::sleep(self.config.schedule_debounce) => {}
                    }
                    // Signals that arrived during the debounce window are
                    // served by this evaluation.
                    self.signal.absorb_pending();
                }
                _ = interval.tick() => {}
            }
            self.schedule_jobs().await;
        }
    }

    /// Measure the backlog and admit enough run-one-job tasks to cover it.
    /// Returns the number of tasks admitted.
    #[instrument(
        name = "job.schedule_jobs",
        level = "debug",
        skip(self),
        fields(db_queue_size, n_active, n_queued, n_to_admit)
    )]
    pub(crate) async fn schedule_jobs(self: &Arc<Self>) -> usize {
        let db_queue_size = match self.store.count_scheduled().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "could not count scheduled jobs");
                return 0;
            }
        };
        let n_active = self.gate.num_active();
        let n_queued = self.gate.num_queued();
        let n_to_admit = admission_count(db_queue_size, self.config.max_queue_size, n_queued);

        let span = Span::current();
        span.record("db_queue_size", db_queue_size);
        span.record("n_active", n_active);
        span.record("n_queued", n_queued);
        span.record("n_to_admit", n_to_admit);

        if self.last_job_count.load(Ordering::Relaxed) > 0 {
            if db_queue_size == 0 && n_active == 0 {
                tracing::info!("No jobs to run");
            } else {
                tracing::info!(
                    running = n_active,
                    db_queue_size,
                    server_queue_size = n_queued,
                    n_to_admit,
                    "There are {db_queue_size} scheduled jobs. This node is actively running {n_active} with {n_queued} queued; {n_to_admit} more will be added."
                );
            }
        }
        self.last_job_count
            .store(db_queue_size + n_active, Ordering::Relaxed);

        for _ in 0..n_to_admit {
            self.admit_one();
        }
        n_to_admit
    }

    /// Reserve a place at the gate, then spawn the task that waits on it.
    /// Reserving first makes the task visible to the next evaluation's
    /// `num_queued` even before the runtime polls it.
    fn admit_one(self: &Arc<Self>) {
        let reservation = self.gate.reserve();
        let poller = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {}
                _ = poller.run_one(reservation) => {}
            }
        });
    }

    async fn run_one(&self, reservation: Reservation) {
        let permit = reservation.granted().await;
        if self.draining.load(Ordering::SeqCst) {
            return;
        }
        let dispatcher = JobDispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.max_attempts,
        );
        if let Err(e) = dispatcher.execute_next().await {
            tracing::error!(error = %e, "job dispatcher error");
        }
        permit.release();
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.stale_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full period first.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.reap_stale_jobs().await {
                tracing::error!(error = %e, "stale job reaper error");
            }
        }
    }

    #[instrument(name = "job.reap_stale_jobs", level = "debug", skip(self), fields(n_stale_jobs), err)]
    pub(crate) async fn reap_stale_jobs(&self) -> Result<usize, JobError> {
        let rows = self
            .store
            .reclaim_stale(
                self.config.stale_timeout,
                self.config.max_attempts,
                self.config.stale_batch_limit,
            )
            .await?;
        Span::current().record("n_stale_jobs", rows.len());
        if !rows.is_empty() {
            for job in rows.iter() {
                tracing::warn!(job_id = %job.id, status = %job.status, attempts = job.attempts, "stale job reclaimed");
            }
            tracing::info!(
                stale_jobs = rows.len(),
                "Refreshed or failed {} stale jobs",
                rows.len()
            );
        }
        Ok(rows.len())
    }

    pub(crate) fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }
}

impl JobPollerHandle {
    /// Stop scheduling and reaping, wait up to the configured timeout for
    /// running jobs, then abort whatever is left.
    ///
    /// Idempotent. Jobs aborted here stay `running` in the store and are
    /// picked up again by a reaper once they go stale.
    #[instrument(name = "jobs.shutdown", skip(self), fields(n_jobs_aborted))]
    pub async fn shutdown(&self) -> Result<(), JobError> {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let main = self.handle.lock().ok().and_then(|mut h| h.take());
        let reaper = self.reaper.lock().ok().and_then(|mut h| h.take());
        if let Some(main) = main {
            main.stop().await;
        }
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }

        self.poller.draining.store(true, Ordering::SeqCst);
        let gate = self.poller.gate();
        let deadline = tokio::time::Instant::now() + self.poller.config.shutdown_timeout;
        while gate.num_active() > 0 && tokio::time::Instant::now() < deadline {
            crate::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        Span::current().record("n_jobs_aborted", gate.num_active());
        let _ = self.poller.shutdown_tx.send(());
        Ok(())
    }
}

impl Drop for JobPollerHandle {
    fn drop(&mut self) {
        let _ = self.poller.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use std::{num::NonZeroUsize, time::Duration};

    use crate::{
        CurrentJob, JobHandler,
        entity::{JobStatus, JobType, NewJob},
        runner::HandlerError,
        store::MemoryJobStore,
    };

    #[test]
    fn admission_caps_backlog_at_max_queue_size() {
        assert_eq!(admission_count(10, 5, 0), 5);
        assert_eq!(admission_count(3, 5, 1), 2);
        assert_eq!(admission_count(0, 5, 0), 0);
        assert_eq!(admission_count(10, 5, 7), 0);
    }

    struct Sleepy;

    #[async_trait]
    impl JobHandler for Sleepy {
        type Args = u64;
        type Output = u64;

        fn job_type(&self) -> JobType {
            JobType::new("sleepy")
        }

        async fn run(&self, ms: u64, _: CurrentJob) -> Result<u64, HandlerError> {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        }
    }

    async fn poller_with_jobs(
        n: usize,
        config: JobPollerConfig,
    ) -> (Arc<JobPoller>, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        for _ in 0..n {
            let new_job = NewJob::builder()
                .job_type(JobType::new("sleepy"))
                .owner_id("owner")
                .args(200u64)
                .unwrap()
                .build()
                .unwrap();
            store.insert(new_job).await.unwrap();
        }
        let mut registry = JobRegistry::new();
        registry.add_handler(Sleepy);
        let poller = Arc::new(JobPoller::new(
            config,
            store.clone(),
            registry,
            ScheduleSignal::new(),
        ));
        (poller, store)
    }

    #[tokio::test]
    async fn evaluation_admits_up_to_max_queue_size() {
        let config = JobPollerConfig {
            max_concurrent_jobs: NonZeroUsize::new(2).unwrap(),
            max_queue_size: 5,
            ..Default::default()
        };
        let (poller, _store) = poller_with_jobs(10, config).await;

        assert_eq!(poller.schedule_jobs().await, 5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller.gate().num_active(), 2);
        assert_eq!(poller.gate().num_queued(), 3);

        // Queued tasks already cover the capped backlog.
        assert_eq!(poller.schedule_jobs().await, 2);
    }

    #[tokio::test]
    async fn back_to_back_evaluations_respect_max_queue_size() {
        let config = JobPollerConfig {
            max_concurrent_jobs: NonZeroUsize::new(1).unwrap(),
            max_queue_size: 5,
            ..Default::default()
        };
        let (poller, _store) = poller_with_jobs(10, config).await;

        // No yield between evaluations, so no admitted task has been polled yet.
        let admitted: Vec<usize> = vec![
            poller.schedule_jobs().await,
            poller.schedule_jobs().await,
            poller.schedule_jobs().await,
        ];
        assert_eq!(admitted, vec![5, 1, 0]);
        assert_eq!(poller.gate().num_active(), 1);
        assert_eq!(poller.gate().num_queued(), 5);
    }

    #[tokio::test]
    async fn admitted_tasks_drain_the_backlog() {
        let config = JobPollerConfig {
            max_concurrent_jobs: NonZeroUsize::new(4).unwrap(),
            max_queue_size: 10,
            ..Default::default()
        };
        let (poller, store) = poller_with_jobs(4, config).await;

        assert_eq!(poller.schedule_jobs().await, 4);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.count_scheduled().await.unwrap(), 0);
        let done = store
            .find_by_status_and_owner(Some(&[JobStatus::Completed]), None)
            .await
            .unwrap();
        assert_eq!(done.len(), 4);
        assert_eq!(poller.gate().num_active(), 0);
    }

    #[tokio::test]
    async fn reaper_reclaims_jobs_past_the_timeout() {
        let config = JobPollerConfig {
            stale_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (poller, store) = poller_with_jobs(1, config).await;
        let job = store.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller.reap_stale_jobs().await.unwrap(), 1);

        let job = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 1);
    }
}
