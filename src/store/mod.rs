//! The image region store façade.
//!
//! [`ImageRegionStore`] is the component viewers talk to: synchronous cache
//! lookups, blocking thumbnail retrieval, visible-area prefetch
//! registration, listener subscription, selective clearing and teardown.
//!
//! Internally it owns the tile cache, the waiting map of in-flight reads,
//! the two executor pools and the prefetch request manager. Every mutation
//! that must keep the cache and waiting map consistent (tile dispatch, the
//! clear operations) runs under a single monitor — the worker-list mutex —
//! so the two structures cannot desynchronise. The monitor is never held
//! across an await, and never across a call that re-enters it.
//!
//! Workers reference the store through a `Weak` back-pointer, so a store
//! dropped or closed mid-read does not linger until its last worker ends.

pub(crate) mod pools;
pub(crate) mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, trace, warn};

use crate::cache::TileCache;
use crate::config::RegionStoreConfig;
use crate::prefetch::manager::TileRequestManager;
use crate::region::{ImageRegion, RegionRequest};
use crate::server::{ImageServer, SizeEstimator, TileListener};
use pools::ExecutorPools;
pub use worker::{TileWorker, WorkerState};

/// Outcome of a tile dispatch: the three possible answers to "where is
/// this tile?".
pub enum RegionOutcome<T> {
    /// The tile was already cached.
    Tile(T),
    /// Nothing will ever be painted for this request (empty region, or the
    /// store is closed).
    Empty,
    /// A worker is fetching the tile; the same worker is returned to every
    /// concurrent caller.
    Pending(Arc<TileWorker<T>>),
}

/// Shared, memory-bounded store of rendered image tiles.
///
/// One store serves one viewer. It deduplicates concurrent requests for the
/// same region, prefetches tiles around registered visible areas, and
/// notifies listeners as tiles arrive. [`close`](ImageRegionStore::close)
/// tears it down; no operation is meaningful afterwards.
pub struct ImageRegionStore<T> {
    inner: Arc<StoreInner<T>>,
}

pub(crate) struct StoreInner<T> {
    pub(crate) cache: TileCache<T>,
    /// In-flight reads by request; the deduplication point.
    pub(crate) waiting: DashMap<RegionRequest, Arc<TileWorker<T>>>,
    /// Workers started by direct tile requests. Doubles as the façade
    /// monitor: dispatch and clearing serialise on this lock.
    workers: Mutex<Vec<Arc<TileWorker<T>>>>,
    listeners: Mutex<Vec<Arc<dyn TileListener<T>>>>,
    manager: TileRequestManager<T>,
    pools: ExecutorPools,
    /// Diagnostic flag: a clear operation is in progress.
    clearing_cache: AtomicBool,
    config: RegionStoreConfig,
    /// Handed to workers as their back-reference, so in-flight reads never
    /// keep a closed store alive.
    self_ref: Weak<StoreInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> ImageRegionStore<T> {
    /// Creates a store with the given size estimator and configuration.
    ///
    /// Must be called within a tokio runtime: workers are spawned onto it.
    pub fn new(estimator: Box<dyn SizeEstimator<T>>, config: RegionStoreConfig) -> Self {
        let inner = Arc::new_cyclic(|self_ref| StoreInner {
            cache: TileCache::new(estimator, config.tile_cache_bytes),
            waiting: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            manager: TileRequestManager::new(config.prefetch_threads, config.max_z_separation),
            pools: ExecutorPools::new(config.remote_pool_size, config.local_pool_size),
            clearing_cache: AtomicBool::new(false),
            config,
            self_ref: Weak::clone(self_ref),
        });
        Self { inner }
    }

    /// The configured tile cache budget, in bytes. Tiles larger than this
    /// cannot be cached.
    pub fn tile_cache_size(&self) -> u64 {
        self.inner.config.tile_cache_bytes
    }

    /// Returns the cached tile for `request`, or `None`. Never schedules
    /// work.
    pub fn cached_tile(&self, server: &dyn ImageServer<T>, request: &RegionRequest) -> Option<T> {
        debug_assert_eq!(server.path(), request.path());
        self.inner.cache.get(request)
    }

    /// Returns the cached thumbnail for the given plane, or `None`.
    pub fn cached_thumbnail(&self, server: &dyn ImageServer<T>, z: i32, t: i32) -> Option<T> {
        let request = self.inner.thumbnail_request(server, z, t);
        self.inner.cache.get(&request)
    }

    /// Returns a thumbnail for the given plane, fetching it if necessary.
    ///
    /// Waits on the in-flight worker if one exists, or starts one. If the
    /// worker fails or is cancelled, falls back to a single direct region
    /// read; `add_to_cache` controls whether that fallback result is
    /// cached. Returns `None` only if the direct read also fails.
    pub async fn thumbnail(
        &self,
        server: &Arc<dyn ImageServer<T>>,
        z: i32,
        t: i32,
        add_to_cache: bool,
    ) -> Option<T> {
        let request = self.inner.thumbnail_request(server.as_ref(), z, t);
        let worker = match self
            .inner
            .request_image_tile(server, request.clone(), true)
        {
            RegionOutcome::Tile(tile) => return Some(tile),
            RegionOutcome::Empty => return None,
            RegionOutcome::Pending(worker) => worker,
        };

        debug!(path = server.path(), z, t, "waiting for thumbnail worker");
        if let Some(tile) = worker.wait().await {
            return Some(tile);
        }

        // Shouldn't happen; read the region directly as a last resort
        warn!(%request, "thumbnail worker produced nothing, falling back to a direct read");
        match server.read_region(&request).await {
            Ok(Some(tile)) => {
                if add_to_cache {
                    self.inner.cache.insert(request, tile.clone());
                }
                Some(tile)
            }
            Ok(None) => None,
            Err(reason) => {
                error!(%request, %reason, "unable to obtain thumbnail");
                None
            }
        }
    }

    /// Requests one tile: cached value, empty verdict, or the (possibly
    /// shared) worker fetching it.
    ///
    /// This is the single dispatch gateway — at most one live worker exists
    /// per request.
    pub fn request_image_tile(
        &self,
        server: &Arc<dyn ImageServer<T>>,
        request: RegionRequest,
        ensure_tile: bool,
    ) -> RegionOutcome<T> {
        self.inner.request_image_tile(server, request, ensure_tile)
    }

    /// Registers a visible-area prefetch for a listener.
    ///
    /// Tiles covering `clip` at the requested downsample — and, once those
    /// drain, coarse tiles of neighbouring Z slices — are fetched
    /// preemptively. A registration identical to the listener's current one
    /// is a no-op; otherwise it replaces it. Returns immediately.
    pub fn register_request(
        &self,
        listener: &Arc<dyn TileListener<T>>,
        server: &Arc<dyn ImageServer<T>>,
        clip: ImageRegion,
        downsample: f64,
        z: i32,
        t: i32,
    ) {
        if self
            .inner
            .manager
            .register_request(listener, server, clip, downsample, z, t)
        {
            self.inner.manager.assign_tasks(&self.inner);
        }
    }

    /// Drops the listener's active prefetch collection, if any. Tiles
    /// already dispatched for it are not cancelled.
    pub fn deregister_request(&self, listener: &Arc<dyn TileListener<T>>) {
        self.inner.manager.deregister_request(listener);
    }

    /// Subscribes a listener to tile-available notifications.
    pub fn add_tile_listener(&self, listener: Arc<dyn TileListener<T>>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Unsubscribes a listener (pointer identity).
    pub fn remove_tile_listener(&self, listener: &Arc<dyn TileListener<T>>) {
        self.inner
            .listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Snapshot of every cached tile belonging to `server`.
    pub fn cached_tiles_for_server(
        &self,
        server: &dyn ImageServer<T>,
    ) -> Vec<(RegionRequest, T)> {
        let path = server.path();
        self.inner.cache.entries_matching(|r| r.path() == path)
    }

    /// Cancels all active workers (if `stop_waiting`), empties the waiting
    /// map and worker list, and clears the cache.
    pub fn clear_cache(&self, stop_waiting: bool) {
        self.inner.clear_cache(stop_waiting);
    }

    /// Removes all cache entries and cancels all waiting workers belonging
    /// to `server`. Other servers are untouched.
    pub fn clear_cache_for_server(&self, server: &dyn ImageServer<T>) {
        self.inner.clear_cache_for_server(server.path());
    }

    /// Removes cache entries and cancels workers whose region overlaps
    /// `request` on the same server and plane.
    pub fn clear_cache_for_request_overlap(&self, request: &RegionRequest) {
        self.inner.clear_cache_for_request_overlap(request);
    }

    /// Cancels workers, shuts down both executor pools and clears the
    /// cache. Idempotent; the store accepts no work afterwards.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Number of requests currently in flight (queued or reading).
    pub fn pending_tile_requests(&self) -> usize {
        self.inner.waiting.len()
    }

    /// Number of live prefetch collections.
    pub fn prefetch_collection_count(&self) -> usize {
        self.inner.manager.collection_count()
    }
}

impl<T: Clone + Send + Sync + 'static> StoreInner<T> {
    pub(crate) fn request_image_tile(
        &self,
        server: &Arc<dyn ImageServer<T>>,
        request: RegionRequest,
        ensure_tile: bool,
    ) -> RegionOutcome<T> {
        let mut workers = self.workers.lock();

        if let Some(tile) = self.cache.get(&request) {
            return RegionOutcome::Tile(tile);
        }
        // The backend may know the region is blank without reading it.
        // Deliberately re-tested on every miss: the cache cannot represent
        // a present-but-empty mapping.
        if server.is_empty_region(&request) {
            return RegionOutcome::Empty;
        }

        if let Some(existing) = self.waiting.get(&request).map(|e| Arc::clone(e.value())) {
            if !existing.is_cancelled() {
                return RegionOutcome::Pending(existing);
            }
            // A cancelled worker left behind by a clear; replace it
            workers.retain(|w| w.id() != existing.id());
        }

        trace!(%request, ensure_tile, "starting tile worker");
        let worker = TileWorker::new(request);
        self.waiting
            .insert(worker.request().clone(), Arc::clone(&worker));
        if !self.submit_worker(&worker, server) {
            self.waiting.remove(worker.request());
            return RegionOutcome::Empty;
        }
        workers.push(Arc::clone(&worker));
        RegionOutcome::Pending(worker)
    }

    /// Spawns the worker's task on the pool matching the server kind.
    /// Returns false (leaving the worker inert) once the pools are shut
    /// down.
    pub(crate) fn submit_worker(
        &self,
        worker: &Arc<TileWorker<T>>,
        server: &Arc<dyn ImageServer<T>>,
    ) -> bool {
        if self.pools.is_shut_down() {
            return false;
        }
        let semaphore = self.pools.pool_for(server.is_generating()).semaphore();
        let store = Weak::clone(&self.self_ref);
        let server = Arc::clone(server);
        let worker = Arc::clone(worker);
        tokio::spawn(run_worker(worker, server, store, semaphore));
        true
    }

    /// Completion hook; every worker calls this exactly once, from its own
    /// task.
    pub(crate) fn worker_complete(&self, worker: &Arc<TileWorker<T>>) {
        {
            let mut workers = self.workers.lock();
            workers.retain(|w| w.id() != worker.id());
        }
        if self.manager.task_completed(worker.id()) {
            self.manager.assign_tasks(self);
        }

        // A cancelled worker, or one whose waiting entry is already gone
        // (cleared or superseded), publishes nothing.
        if worker.is_cancelled() || !self.stop_waiting(worker.request()) {
            return;
        }
        let Some(tile) = worker.result() else {
            return;
        };

        let request = worker.request().clone();
        self.cache.insert(request.clone(), tile.clone());

        // Fan out over a snapshot; the listener list may change mid-flight
        let listeners: Vec<Arc<dyn TileListener<T>>> = self.listeners.lock().clone();
        for listener in listeners {
            listener.tile_available(request.path(), &request, &tile);
        }
    }

    fn stop_waiting(&self, request: &RegionRequest) -> bool {
        if self.clearing_cache.load(Ordering::Acquire) {
            warn!(%request, "stop waiting called while the cache is being cleared");
        }
        self.waiting.remove(request).is_some()
    }

    fn clear_cache(&self, stop_waiting: bool) {
        let mut workers = self.workers.lock();
        self.clearing_cache.store(true, Ordering::Release);
        if stop_waiting {
            for entry in self.waiting.iter() {
                entry.value().cancel();
            }
            self.waiting.clear();
            workers.clear();
        }
        self.cache.clear();
        self.clearing_cache.store(false, Ordering::Release);
    }

    fn clear_cache_for_server(&self, server_path: &str) {
        let mut workers = self.workers.lock();
        self.clearing_cache.store(true, Ordering::Release);
        if !self.waiting.is_empty() {
            trace!(
                size = self.waiting.len(),
                server_path,
                "clearing waiting entries for server"
            );
            self.waiting.retain(|request, worker| {
                if request.path() == server_path {
                    worker.cancel();
                    workers.retain(|w| w.id() != worker.id());
                    false
                } else {
                    true
                }
            });
        }
        self.cache.remove_matching(|request| request.path() == server_path);
        self.clearing_cache.store(false, Ordering::Release);
    }

    fn clear_cache_for_request_overlap(&self, request: &RegionRequest) {
        let mut workers = self.workers.lock();
        if !self.waiting.is_empty() {
            self.waiting.retain(|pending, worker| {
                if request.overlaps(pending) {
                    worker.cancel();
                    workers.retain(|w| w.id() != worker.id());
                    false
                } else {
                    true
                }
            });
        }
        self.cache.remove_matching(|cached| request.overlaps(cached));
    }

    fn close(&self) {
        let snapshot: Vec<Arc<TileWorker<T>>> = self.workers.lock().clone();
        for worker in snapshot {
            worker.cancel();
        }
        for entry in self.waiting.iter() {
            entry.value().cancel();
        }
        self.pools.shutdown();
        self.cache.clear();
    }

    fn thumbnail_request(&self, server: &dyn ImageServer<T>, z: i32, t: i32) -> RegionRequest {
        let mut downsample = 1.0;
        if server.n_resolutions() > 1 {
            downsample = thumbnail_downsample(
                server.width(),
                server.height(),
                self.config.max_thumbnail_size,
                self.config.min_thumbnail_size,
            );
        }
        // Guard against accidental upsampling
        downsample = downsample.max(1.0);
        RegionRequest::new(
            server.path(),
            downsample,
            0,
            0,
            server.width(),
            server.height(),
            z,
            t,
        )
    }
}

/// Downsample for a thumbnail covering the whole image: small enough to fit
/// `max_size` in the larger dimension without shrinking the smaller one
/// below `min_size`.
fn thumbnail_downsample(width: i32, height: i32, max_size: i32, min_size: i32) -> f64 {
    let max_dim = f64::from(width.max(height));
    let min_dim = f64::from(width.min(height));
    if min_dim > f64::from(min_size) {
        let max_downsample = min_dim / f64::from(min_size);
        (max_dim / f64::from(max_size)).min(max_downsample).max(1.0)
    } else {
        1.0
    }
}

/// One worker's lifetime: wait for a pool permit, read the region, record
/// the outcome, and always hand control back to the store.
async fn run_worker<T: Clone + Send + Sync + 'static>(
    worker: Arc<TileWorker<T>>,
    server: Arc<dyn ImageServer<T>>,
    store: Weak<StoreInner<T>>,
    semaphore: Arc<Semaphore>,
) {
    let permit = tokio::select! {
        _ = worker.cancel_token().cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };

    match permit {
        Some(_permit) if !worker.is_cancelled() => {
            worker.mark_running();
            let tile = read_tile(&worker, &server, &store).await;
            worker.finish(tile);
        }
        _ => {
            // Cancelled while queued, or the pool closed under us
            worker.cancel();
        }
    }

    if let Some(store) = store.upgrade() {
        store.worker_complete(&worker);
    }
}

async fn read_tile<T: Clone + Send + Sync + 'static>(
    worker: &Arc<TileWorker<T>>,
    server: &Arc<dyn ImageServer<T>>,
    store: &Weak<StoreInner<T>>,
) -> Option<T> {
    // A concurrent fetch may have filled the cache while we were queued
    if let Some(store) = store.upgrade() {
        if let Some(tile) = store.cache.get(worker.request()) {
            return Some(tile);
        }
    }

    tokio::select! {
        _ = worker.cancel_token().cancelled() => None,
        result = server.read_region(worker.request()) => match result {
            Ok(tile) => tile,
            Err(reason) => {
                warn!(request = %worker.request(), %reason, "tile read failed");
                None
            }
        }
    }
}
