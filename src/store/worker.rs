//! Cancellable single-shot tile workers.
//!
//! A [`TileWorker`] is the handle for one in-flight region read. Its state
//! machine is `Queued → Running → Done`, with `cancel()` moving any
//! pre-terminal state to `Cancelled`. The state is published through a
//! watch channel so waiters can observe the transition to a terminal state
//! without polling; the result lives in a shared holder read by both the
//! completion path and blocking thumbnail callers.
//!
//! Cancellation is two-sided: the state flips to `Cancelled` immediately
//! (so a result that loses the race is never published), and a token aborts
//! the in-flight read. A worker that reaches `Done` first stays `Done`;
//! a later `cancel()` cannot retract a completed result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::region::RegionRequest;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`TileWorker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Submitted, waiting for a pool permit.
    Queued,
    /// Holding a permit, reading the region.
    Running,
    /// Finished; the result (possibly absent) is available.
    Done,
    /// Cancelled before completion; any result is discarded.
    Cancelled,
}

impl WorkerState {
    /// Terminal states are `Done` and `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Handle for one in-flight tile read.
pub struct TileWorker<T> {
    id: u64,
    request: RegionRequest,
    state_tx: watch::Sender<WorkerState>,
    cancel: CancellationToken,
    result: Mutex<Option<T>>,
}

impl<T: Clone> TileWorker<T> {
    /// Creates a worker in the `Queued` state.
    pub(crate) fn new(request: RegionRequest) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WorkerState::Queued);
        Arc::new(Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            request,
            state_tx,
            cancel: CancellationToken::new(),
            result: Mutex::new(None),
        })
    }

    /// Process-unique worker identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The region this worker is fetching.
    pub fn request(&self) -> &RegionRequest {
        &self.request
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// True if the worker ended in the `Cancelled` state.
    ///
    /// A cancel that arrives after completion does not count: the worker is
    /// `Done` and its result stands.
    pub fn is_cancelled(&self) -> bool {
        self.state() == WorkerState::Cancelled
    }

    /// Requests cancellation: flips any pre-terminal state to `Cancelled`
    /// and aborts an in-flight read.
    pub fn cancel(&self) {
        self.state_tx.send_modify(|state| {
            if !state.is_terminal() {
                *state = WorkerState::Cancelled;
            }
        });
        self.cancel.cancel();
    }

    /// Token observed by the worker task to abort queued waits and reads.
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Transitions `Queued → Running`, unless already cancelled.
    pub(crate) fn mark_running(&self) {
        self.state_tx.send_modify(|state| {
            if *state == WorkerState::Queued {
                *state = WorkerState::Running;
            }
        });
    }

    /// Records the outcome of the read and transitions to `Done`.
    ///
    /// If the worker was cancelled in the meantime the state stays
    /// `Cancelled` and the result is discarded.
    pub(crate) fn finish(&self, tile: Option<T>) {
        let mut completed = false;
        self.state_tx.send_modify(|state| {
            if !state.is_terminal() {
                *state = WorkerState::Done;
                completed = true;
            }
        });
        if completed {
            *self.result.lock() = tile;
        }
    }

    /// The tile this worker produced, if it completed with one.
    pub fn result(&self) -> Option<T> {
        self.result.lock().clone()
    }

    /// Waits for the worker to reach a terminal state and returns its tile.
    ///
    /// Returns `None` for a cancelled worker, an empty read, or a failed
    /// read.
    pub async fn wait(&self) -> Option<T> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            if state_rx.borrow().is_terminal() {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        if self.state() == WorkerState::Done {
            self.result()
        } else {
            None
        }
    }
}

impl<T> std::fmt::Debug for TileWorker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileWorker")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}
