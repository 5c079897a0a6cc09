//! Executor pools for tile workers.
//!
//! Two fixed-capacity, semaphore-backed pools: a larger **remote** pool for
//! servers whose reads touch disk or the network, and a smaller **local**
//! pool reserved for generating servers that synthesise tiles in-process.
//! Keeping them separate stops high-latency remote reads from queueing in
//! front of cheap tile generation and starving repaints.
//!
//! Each worker task acquires one permit before running, so a pool admits at
//! most `capacity` concurrent reads. Shutting down closes both semaphores:
//! queued acquisitions resolve immediately as cancellations, and new
//! submissions are refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

/// A fixed-capacity pool admitting workers through a semaphore.
pub(crate) struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be > 0");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The semaphore workers acquire a permit from before running.
    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    /// Total permit count.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The remote/local pool pair owned by a store.
pub(crate) struct ExecutorPools {
    remote: WorkerPool,
    local: WorkerPool,
    shut_down: AtomicBool,
}

impl ExecutorPools {
    pub(crate) fn new(remote_capacity: usize, local_capacity: usize) -> Self {
        Self {
            remote: WorkerPool::new(remote_capacity),
            local: WorkerPool::new(local_capacity),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Selects the pool for a server: generating servers go local,
    /// everything else goes remote.
    pub(crate) fn pool_for(&self, generating: bool) -> &WorkerPool {
        if generating {
            &self.local
        } else {
            &self.remote
        }
    }

    pub(crate) fn remote(&self) -> &WorkerPool {
        &self.remote
    }

    pub(crate) fn local(&self) -> &WorkerPool {
        &self.local
    }

    /// True once [`shutdown`](Self::shutdown) has been called; submissions
    /// must be refused.
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Closes both pools. Idempotent. Workers still waiting on a permit
    /// observe the closed semaphore and finish as cancelled.
    pub(crate) fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.remote.semaphore.close();
        self.local.semaphore.close();
        debug!(
            remote = self.remote().capacity(),
            local = self.local().capacity(),
            "executor pools shut down"
        );
    }
}
