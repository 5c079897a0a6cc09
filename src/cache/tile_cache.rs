//! Weight-bounded concurrent tile cache.
//!
//! Tiles are stored in a sharded concurrent map for lock-free reads, with a
//! separate mutex-protected queue tracking least-recently-used order for
//! eviction. Each entry is charged a weight in KiB units computed by the
//! caller-provided [`SizeEstimator`]; inserting past the configured budget
//! evicts LRU entries until the total fits again.
//!
//! Weights are kept in KiB so that even very large tiles fit a 32-bit
//! bound: a real tile always weighs at least 1 and at most `u32::MAX`.
//! A tile heavier than the entire budget is never retained.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::region::RegionRequest;
use crate::server::SizeEstimator;

struct CacheEntry<T> {
    tile: T,
    weight: u64,
}

/// Concurrent RegionRequest → tile map with byte-weighted LRU eviction.
pub struct TileCache<T> {
    tiles: DashMap<RegionRequest, CacheEntry<T>>,
    /// LRU order: front is the eviction candidate.
    lru: Mutex<VecDeque<RegionRequest>>,
    estimator: Box<dyn SizeEstimator<T>>,
    /// Budget in KiB units.
    max_weight: u64,
    /// Aggregate weight of live entries, in KiB units.
    current_weight: AtomicU64,
}

impl<T: Clone> TileCache<T> {
    /// Creates a cache with the given byte budget.
    pub fn new(estimator: Box<dyn SizeEstimator<T>>, max_bytes: u64) -> Self {
        Self {
            tiles: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            estimator,
            max_weight: (max_bytes / 1024).max(1),
            current_weight: AtomicU64::new(0),
        }
    }

    fn weigh(&self, tile: &T) -> u64 {
        (self.estimator.approx_size(tile) / 1024).clamp(1, u32::MAX as u64)
    }

    /// Returns the cached tile, marking it most recently used.
    pub fn get(&self, request: &RegionRequest) -> Option<T> {
        let tile = self.tiles.get(request).map(|entry| entry.tile.clone())?;
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|r| r == request) {
            lru.remove(pos);
            lru.push_back(request.clone());
        }
        Some(tile)
    }

    /// Returns true without updating LRU order.
    pub fn contains(&self, request: &RegionRequest) -> bool {
        self.tiles.contains_key(request)
    }

    /// Inserts a tile, evicting LRU entries if the budget is exceeded.
    ///
    /// A tile heavier than the whole budget is dropped rather than letting
    /// it flush every other entry.
    pub fn insert(&self, request: RegionRequest, tile: T) {
        let weight = self.weigh(&tile);
        if weight > self.max_weight {
            debug!(%request, weight, max_weight = self.max_weight, "tile exceeds cache budget, not retained");
            return;
        }

        if let Some((_, old)) = self.tiles.remove(&request) {
            self.current_weight.fetch_sub(old.weight, Ordering::Relaxed);
            let mut lru = self.lru.lock();
            if let Some(pos) = lru.iter().position(|r| r == &request) {
                lru.remove(pos);
            }
        }

        self.tiles.insert(request.clone(), CacheEntry { tile, weight });
        self.current_weight.fetch_add(weight, Ordering::Relaxed);
        self.lru.lock().push_back(request);

        self.evict_over_budget();
    }

    fn evict_over_budget(&self) {
        while self.current_weight.load(Ordering::Relaxed) > self.max_weight {
            let victim = { self.lru.lock().pop_front() };
            let Some(victim) = victim else {
                break;
            };
            if let Some((_, entry)) = self.tiles.remove(&victim) {
                self.current_weight.fetch_sub(entry.weight, Ordering::Relaxed);
                trace!(request = %victim, "evicted tile");
            }
        }
    }

    /// Removes one entry, returning its tile.
    pub fn remove(&self, request: &RegionRequest) -> Option<T> {
        let (_, entry) = self.tiles.remove(request)?;
        self.current_weight.fetch_sub(entry.weight, Ordering::Relaxed);
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|r| r == request) {
            lru.remove(pos);
        }
        Some(entry.tile)
    }

    /// Removes every entry whose key matches the predicate. Returns the
    /// number of entries removed.
    pub fn remove_matching(&self, predicate: impl Fn(&RegionRequest) -> bool) -> usize {
        let victims: Vec<RegionRequest> = self
            .tiles
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        if victims.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for victim in &victims {
            if let Some((_, entry)) = self.tiles.remove(victim) {
                self.current_weight.fetch_sub(entry.weight, Ordering::Relaxed);
                removed += 1;
            }
        }

        let victim_set: HashSet<&RegionRequest> = victims.iter().collect();
        self.lru.lock().retain(|r| !victim_set.contains(r));
        removed
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.tiles.clear();
        self.lru.lock().clear();
        self.current_weight.store(0, Ordering::Relaxed);
    }

    /// Snapshot of all entries matching the predicate.
    pub fn entries_matching(
        &self,
        predicate: impl Fn(&RegionRequest) -> bool,
    ) -> Vec<(RegionRequest, T)> {
        self.tiles
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| (entry.key().clone(), entry.value().tile.clone()))
            .collect()
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Returns true if no tiles are cached.
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Aggregate weight of live entries, in KiB units.
    pub fn current_weight(&self) -> u64 {
        self.current_weight.load(Ordering::Relaxed)
    }

    /// Configured budget, in KiB units.
    pub fn max_weight(&self) -> u64 {
        self.max_weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct FakeTile {
        bytes: u64,
        tag: u32,
    }

    struct FakeEstimator;

    impl SizeEstimator<FakeTile> for FakeEstimator {
        fn approx_size(&self, tile: &FakeTile) -> u64 {
            tile.bytes
        }
    }

    fn cache(max_bytes: u64) -> TileCache<FakeTile> {
        TileCache::new(Box::new(FakeEstimator), max_bytes)
    }

    fn request(path: &str, x: i32) -> RegionRequest {
        RegionRequest::new(path, 1.0, x, 0, 256, 256, 0, 0)
    }

    fn tile(kib: u64) -> FakeTile {
        FakeTile {
            bytes: kib * 1024,
            tag: 0,
        }
    }

    #[test]
    fn insert_and_get() {
        let cache = cache(1024 * 1024);
        let req = request("sA", 0);
        assert!(cache.get(&req).is_none());

        cache.insert(req.clone(), tile(4));
        assert_eq!(cache.get(&req), Some(tile(4)));
        assert!(cache.contains(&req));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn weight_tracked_in_kib() {
        let cache = cache(1024 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sA", 256), tile(8));
        assert_eq!(cache.current_weight(), 12);
    }

    #[test]
    fn small_tiles_weigh_at_least_one() {
        let cache = cache(1024 * 1024);
        cache.insert(
            request("sA", 0),
            FakeTile {
                bytes: 10,
                tag: 0,
            },
        );
        assert_eq!(cache.current_weight(), 1);
    }

    #[test]
    fn eviction_keeps_weight_under_budget() {
        // Budget of 8 KiB, each tile 4 KiB
        let cache = cache(8 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sA", 256), tile(4));
        cache.insert(request("sA", 512), tile(4));

        assert!(cache.current_weight() <= cache.max_weight());
        assert!(!cache.contains(&request("sA", 0)));
        assert!(cache.contains(&request("sA", 256)));
        assert!(cache.contains(&request("sA", 512)));
    }

    #[test]
    fn get_refreshes_lru_position() {
        let cache = cache(8 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sA", 256), tile(4));

        // Touch the older entry so the newer one is evicted next
        cache.get(&request("sA", 0));
        cache.insert(request("sA", 512), tile(4));

        assert!(cache.contains(&request("sA", 0)));
        assert!(!cache.contains(&request("sA", 256)));
        assert!(cache.contains(&request("sA", 512)));
    }

    #[test]
    fn oversized_tile_not_retained() {
        let cache = cache(8 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sA", 256), tile(100));

        assert!(!cache.contains(&request("sA", 256)));
        // Existing entries survive the rejected insert
        assert!(cache.contains(&request("sA", 0)));
        assert_eq!(cache.current_weight(), 4);
    }

    #[test]
    fn reinsert_replaces_weight() {
        let cache = cache(1024 * 1024);
        let req = request("sA", 0);
        cache.insert(req.clone(), tile(4));
        cache.insert(
            req.clone(),
            FakeTile {
                bytes: 8 * 1024,
                tag: 1,
            },
        );

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_weight(), 8);
        assert_eq!(cache.get(&req).unwrap().tag, 1);
    }

    #[test]
    fn remove_returns_tile_and_releases_weight() {
        let cache = cache(1024 * 1024);
        let req = request("sA", 0);
        cache.insert(req.clone(), tile(4));

        assert_eq!(cache.remove(&req), Some(tile(4)));
        assert_eq!(cache.current_weight(), 0);
        assert!(cache.is_empty());
        assert!(cache.remove(&req).is_none());
    }

    #[test]
    fn remove_matching_by_path() {
        let cache = cache(1024 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sA", 256), tile(4));
        cache.insert(request("sB", 0), tile(4));

        let removed = cache.remove_matching(|r| r.path() == "sA");
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&request("sB", 0)));
        assert_eq!(cache.current_weight(), 4);
    }

    #[test]
    fn clear_resets_everything() {
        let cache = cache(1024 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sB", 0), tile(4));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_weight(), 0);
    }

    #[test]
    fn entries_matching_snapshot() {
        let cache = cache(1024 * 1024);
        cache.insert(request("sA", 0), tile(4));
        cache.insert(request("sB", 0), tile(8));

        let entries = cache.entries_matching(|r| r.path() == "sB");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, request("sB", 0));
        assert_eq!(entries[0].1, tile(8));
    }

    #[test]
    fn eviction_makes_progress_under_exact_budget() {
        // Budget equals a single tile: each insert evicts the previous one
        let cache = cache(4 * 1024);
        for x in 0..10 {
            cache.insert(request("sA", x * 256), tile(4));
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&request("sA", 9 * 256)));
    }
}
