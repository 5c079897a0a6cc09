//! Priority scheduler over active prefetch collections.
//!
//! The manager keeps at most `n_threads` prefetch workers busy, always
//! drawing from the highest-priority collection: lowest Z separation first,
//! then oldest registration. Requests already cached or already in flight
//! are skipped without charging a worker slot. Completion of a
//! manager-owned worker frees its slot and immediately re-assigns.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::prefetch::collection::TileRequestCollection;
use crate::region::ImageRegion;
use crate::server::{ImageServer, TileListener};
use crate::store::worker::TileWorker;
use crate::store::StoreInner;

struct ManagerState<T> {
    collections: Vec<TileRequestCollection<T>>,
    /// Ids of workers this manager dispatched and still owns.
    requested: Vec<u64>,
    busy_threads: usize,
}

/// Scheduler for visible-area prefetch registrations.
pub(crate) struct TileRequestManager<T> {
    state: Mutex<ManagerState<T>>,
    n_threads: usize,
    max_z_separation: i32,
}

impl<T: Clone + Send + Sync + 'static> TileRequestManager<T> {
    pub(crate) fn new(n_threads: usize, max_z_separation: i32) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                collections: Vec::new(),
                requested: Vec::new(),
                busy_threads: 0,
            }),
            n_threads,
            max_z_separation,
        }
    }

    /// Registers a visible-area request for a listener.
    ///
    /// An identical registration (same clip, z and t) from the same
    /// listener is absorbed silently; anything else replaces the listener's
    /// previous collection. Returns true if the collection list changed and
    /// tasks should be (re)assigned.
    pub(crate) fn register_request(
        &self,
        listener: &Arc<dyn TileListener<T>>,
        server: &Arc<dyn ImageServer<T>>,
        clip: ImageRegion,
        downsample: f64,
        z: i32,
        t: i32,
    ) -> bool {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .collections
            .iter()
            .position(|c| c.matches_listener(listener))
        {
            if state.collections[pos].same_registration(&clip, z, t) {
                return false;
            }
            state.collections.remove(pos);
        }

        let collection = TileRequestCollection::new(
            Arc::clone(listener),
            Arc::clone(server),
            clip,
            downsample,
            z,
            t,
            self.max_z_separation,
        );
        state.collections.push(collection);
        Self::sort(&mut state.collections);
        true
    }

    /// Drops the listener's collection, if any.
    pub(crate) fn deregister_request(&self, listener: &Arc<dyn TileListener<T>>) {
        let mut state = self.state.lock();
        state.collections.retain(|c| !c.matches_listener(listener));
    }

    /// Keeps up to `n_threads` workers busy from the highest-priority
    /// collections.
    ///
    /// Holds the manager lock for the whole loop; the waiting map and cache
    /// are internally concurrent so no other lock is needed.
    pub(crate) fn assign_tasks(&self, store: &StoreInner<T>) {
        let mut state = self.state.lock();
        if state.collections.is_empty() {
            return;
        }

        while state.busy_threads < self.n_threads {
            if state.collections.is_empty() {
                break;
            }
            if !state.collections[0].has_more_tiles() {
                state.collections.remove(0);
                continue;
            }

            let server = Arc::clone(state.collections[0].server());
            let Some(request) = state.collections[0].next_tile_request() else {
                continue;
            };
            // Already there, or on its way: don't charge a slot
            if store.cache.contains(&request) || store.waiting.contains_key(&request) {
                continue;
            }

            let worker = TileWorker::new(request);
            trace!(request = %worker.request(), "adding prefetch worker to waiting map");
            store
                .waiting
                .insert(worker.request().clone(), Arc::clone(&worker));
            if !store.submit_worker(&worker, &server) {
                store.waiting.remove(worker.request());
                break;
            }
            state.requested.push(worker.id());
            state.busy_threads += 1;
        }

        // Enumeration may have advanced a collection's Z separation
        Self::sort(&mut state.collections);
    }

    /// Releases the slot held by a manager-owned worker.
    ///
    /// Returns true if the worker was owned by this manager; the caller
    /// then re-runs [`assign_tasks`](Self::assign_tasks). Workers started
    /// by direct tile requests do not affect scheduling.
    pub(crate) fn task_completed(&self, worker_id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.requested.iter().position(|&id| id == worker_id) else {
            return false;
        };
        state.requested.remove(pos);
        state.busy_threads -= 1;
        trace!(busy_threads = state.busy_threads, "prefetch worker released");
        Self::sort(&mut state.collections);
        true
    }

    /// Number of live collections.
    pub(crate) fn collection_count(&self) -> usize {
        self.state.lock().collections.len()
    }

    fn sort(collections: &mut [TileRequestCollection<T>]) {
        collections.sort_by(Self::priority);
    }

    /// Collections closest to the focal plane come first; age breaks ties,
    /// older registrations first.
    fn priority(a: &TileRequestCollection<T>, b: &TileRequestCollection<T>) -> CmpOrdering {
        a.z_separation()
            .cmp(&b.z_separation())
            .then_with(|| a.timestamp().cmp(&b.timestamp()))
    }
}
