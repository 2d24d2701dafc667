use futures::FutureExt;
use tokio::sync::Notify;

use std::sync::Arc;

#[derive(Clone, Default)]
/// Wakes the scheduler when new jobs are inserted.
///
/// Signals coalesce: any number of calls to [`ScheduleSignal::job_inserted`]
/// while the scheduler is busy leave a single pending wake-up.
pub(crate) struct ScheduleSignal {
    notify: Arc<Notify>,
}

impl ScheduleSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_inserted(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Consume a pending wake-up, if any. Returns whether one was pending.
    pub fn absorb_pending(&self) -> bool {
        self.notify.notified().now_or_never().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bursts_collapse_into_one_pending_signal() {
        let signal = ScheduleSignal::new();
        for _ in 0..10 {
            signal.job_inserted();
        }
        assert!(signal.absorb_pending());
        assert!(!signal.absorb_pending());
    }
}
