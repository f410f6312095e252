//! Bounded-concurrency gate with a pending counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Semaphore that also counts callers waiting for or holding a permit
///
/// The count is what the load-balanced strategy compares across workers.
#[derive(Clone)]
pub(crate) struct Gate {
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
}

/// Held while inside the gate; leaving drops the permit and the pending count
pub(crate) struct GateGuard {
    pending: Arc<AtomicUsize>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gate {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a slot
    ///
    /// The caller counts as pending from the moment it starts waiting, and
    /// stops counting even if the wait is cancelled.
    pub(crate) async fn enter(&self) -> GateGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let mut guard = GateGuard {
            pending: Arc::clone(&self.pending),
            _permit: None,
        };
        // The semaphore is never closed, so acquisition only fails on shutdown paths
        guard._permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        guard
    }

    /// Callers waiting for or holding a slot
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_bounds_concurrent_holders() {
        let gate = Gate::new(2);

        let a = gate.enter().await;
        let _b = gate.enter().await;
        assert_eq!(gate.semaphore.available_permits(), 0);
        assert_eq!(gate.pending(), 2);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _c = gate.enter().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.pending(), 3, "waiting caller counts as pending");
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap();
        assert_eq!(gate.pending(), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_stops_counting() {
        let gate = Gate::new(1);
        let _held = gate.enter().await;

        let result = tokio::time::timeout(Duration::from_millis(10), gate.enter()).await;

        assert!(result.is_err());
        assert_eq!(gate.pending(), 1);
    }
}
