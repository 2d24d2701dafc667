//! FIFO-fair bounded concurrency gate.
//!
//! A released permit is handed directly to the longest waiting caller, so the
//! number of active holders never dips while work is queued.

use tokio::sync::oneshot;

use std::{
    collections::VecDeque,
    future::Future,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

#[derive(Clone)]
/// Grants at most `max_concurrency` permits at a time. Clones share state.
pub struct ConcurrencyGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    max_concurrency: usize,
    state: Mutex<GateState>,
}

struct GateState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<GatePermit>>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_concurrency: max_concurrency.get(),
                state: Mutex::new(GateState {
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a permit. Callers beyond the limit are served in arrival order.
    pub async fn acquire(&self) -> GatePermit {
        self.reserve().granted().await
    }

    /// Take a place in line without waiting.
    ///
    /// The caller holds a permit or counts in [`num_queued`](Self::num_queued)
    /// from the moment this returns, before any task awaits the reservation.
    pub fn reserve(&self) -> Reservation {
        let mut state = self.inner.lock();
        if state.active < self.inner.max_concurrency {
            state.active += 1;
            return Reservation(ReservationState::Granted(GatePermit::new(Arc::clone(
                &self.inner,
            ))));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Reservation(ReservationState::Queued {
            rx,
            _gate: Arc::clone(&self.inner),
        })
    }

    /// Run `fut` while holding a permit.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let permit = self.acquire().await;
        let output = fut.await;
        permit.release();
        output
    }

    /// Number of permits currently held.
    pub fn num_active(&self) -> usize {
        self.inner.lock().active
    }

    /// Number of callers waiting for a permit.
    pub fn num_queued(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

impl GateInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // Critical sections never panic, so a poisoned lock still holds
        // consistent counters.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.lock();
                match state.waiters.pop_front() {
                    Some(tx) => tx,
                    None => {
                        state.active -= 1;
                        return;
                    }
                }
            };
            match next.send(GatePermit::new(Arc::clone(&self))) {
                Ok(()) => return,
                // Waiter gave up; disarm the permit and offer it to the next one.
                Err(mut permit) => {
                    permit.gate.take();
                }
            }
        }
    }
}

#[must_use = "dropping a reservation gives up its place in line"]
/// A place in a [`ConcurrencyGate`]'s line, obtained with [`ConcurrencyGate::reserve`].
pub struct Reservation(ReservationState);

enum ReservationState {
    Granted(GatePermit),
    Queued {
        rx: oneshot::Receiver<GatePermit>,
        // Keeps the queued sender alive until it is served or skipped.
        _gate: Arc<GateInner>,
    },
}

impl Reservation {
    /// Wait until the reservation turns into a permit.
    pub async fn granted(self) -> GatePermit {
        match self.0 {
            ReservationState::Granted(permit) => permit,
            ReservationState::Queued { rx, _gate } => match rx.await {
                Ok(permit) => permit,
                Err(_) => unreachable!("gate dropped a queued waiter"),
            },
        }
    }
}

#[must_use = "dropping a permit releases it immediately"]
/// Proof of admission through a [`ConcurrencyGate`]. Released on drop.
pub struct GatePermit {
    gate: Option<Arc<GateInner>>,
}

impl GatePermit {
    fn new(gate: Arc<GateInner>) -> Self {
        Self { gate: Some(gate) }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn gate(max_concurrency: usize) -> ConcurrencyGate {
        ConcurrencyGate::new(NonZeroUsize::new(max_concurrency).unwrap())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn grants_up_to_limit_then_queues() {
        let gate = gate(2);
        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;
        assert_eq!(gate.num_active(), 2);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        settle().await;
        assert_eq!(gate.num_queued(), 1);
        assert_eq!(gate.num_active(), 2);

        p1.release();
        let _p3 = waiter.await.unwrap();
        assert_eq!(gate.num_queued(), 0);
        assert_eq!(gate.num_active(), 2);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = gate(1);
        let first = gate.acquire().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = gate.acquire().await;
                tx.send(i).unwrap();
                permit.release();
            });
            settle().await;
        }
        assert_eq!(gate.num_queued(), 3);

        drop(first);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(gate.num_active(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_permit() {
        let gate = gate(1);
        let held = gate.acquire().await;

        let abandoned = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _ = gate.acquire().await;
            })
        };
        settle().await;
        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(gate.num_queued(), 0);

        held.release();
        assert_eq!(gate.num_active(), 0);
        let _again = gate.acquire().await;
        assert_eq!(gate.num_active(), 1);
    }

    #[tokio::test]
    async fn reservation_holds_its_place_before_it_is_awaited() {
        let gate = gate(1);
        let first = gate.reserve();
        let second = gate.reserve();
        assert_eq!(gate.num_active(), 1);
        assert_eq!(gate.num_queued(), 1);

        let first = first.granted().await;
        drop(first);
        let _second = second.granted().await;
        assert_eq!(gate.num_active(), 1);
        assert_eq!(gate.num_queued(), 0);
    }

    #[tokio::test]
    async fn run_releases_after_completion() {
        let gate = gate(1);
        let value = gate.run(async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(gate.num_active(), 0);
    }
}
