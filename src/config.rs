//! Store configuration.
//!
//! All tunables live here: the tile cache byte budget, thumbnail size
//! bounds, prefetch concurrency, the Z prefetch horizon, and the two
//! executor pool capacities. Defaults match interactive viewing of large
//! pyramidal images; tests pin the pool sizes to deterministic values.

/// Default tile cache budget: 256 MB.
pub const DEFAULT_TILE_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Default maximum thumbnail dimension, in pixels.
pub const DEFAULT_MAX_THUMBNAIL_SIZE: i32 = 1024;

/// Default minimum thumbnail dimension, in pixels.
pub const DEFAULT_MIN_THUMBNAIL_SIZE: i32 = 16;

/// Default number of concurrent prefetch workers.
pub const DEFAULT_PREFETCH_THREADS: usize = 10;

/// Default maximum Z-slice separation for prefetching neighbouring planes.
pub const DEFAULT_MAX_Z_SEPARATION: i32 = 10;

/// Lower bound on the remote pool capacity.
const MIN_REMOTE_POOL_SIZE: usize = 8;

/// Upper bound on the remote pool capacity.
const MAX_REMOTE_POOL_SIZE: usize = 32;

/// Configuration for an [`ImageRegionStore`](crate::store::ImageRegionStore).
#[derive(Clone, Debug)]
pub struct RegionStoreConfig {
    /// Maximum aggregate weight of cached tiles, in bytes.
    ///
    /// Individual tiles larger than this cannot be retained.
    pub tile_cache_bytes: u64,

    /// Maximum thumbnail dimension. Default: 1024.
    pub max_thumbnail_size: i32,

    /// Minimum thumbnail dimension. Default: 16.
    pub min_thumbnail_size: i32,

    /// Number of prefetch workers the request manager keeps busy. Default: 10.
    pub prefetch_threads: usize,

    /// Maximum distance (in focal planes) at which neighbouring Z slices are
    /// prefetched. Clamped per server to `n_z_slices - 1`. Default: 10.
    pub max_z_separation: i32,

    /// Remote pool capacity, for slow sources (disk, network).
    ///
    /// Default: `clamp(available_parallelism * 4, 8, 32)`.
    pub remote_pool_size: usize,

    /// Local pool capacity, for in-process generating servers.
    ///
    /// Default: `available_parallelism`. Kept separate from the remote pool
    /// so slow network reads cannot starve cheap synthetic tiles.
    pub local_pool_size: usize,
}

impl Default for RegionStoreConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);

        Self {
            tile_cache_bytes: DEFAULT_TILE_CACHE_BYTES,
            max_thumbnail_size: DEFAULT_MAX_THUMBNAIL_SIZE,
            min_thumbnail_size: DEFAULT_MIN_THUMBNAIL_SIZE,
            prefetch_threads: DEFAULT_PREFETCH_THREADS,
            max_z_separation: DEFAULT_MAX_Z_SEPARATION,
            remote_pool_size: (cpus * 4).clamp(MIN_REMOTE_POOL_SIZE, MAX_REMOTE_POOL_SIZE),
            local_pool_size: cpus,
        }
    }
}

impl RegionStoreConfig {
    /// Creates a configuration with the given cache budget and defaults for
    /// everything else.
    pub fn with_cache_bytes(tile_cache_bytes: u64) -> Self {
        Self {
            tile_cache_bytes,
            ..Self::default()
        }
    }

    /// Sets the prefetch worker count (builder pattern).
    pub fn prefetch_threads(mut self, n: usize) -> Self {
        self.prefetch_threads = n;
        self
    }

    /// Sets the maximum Z separation (builder pattern).
    pub fn max_z_separation(mut self, separation: i32) -> Self {
        self.max_z_separation = separation;
        self
    }

    /// Sets both pool capacities (builder pattern).
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero.
    pub fn pool_sizes(mut self, remote: usize, local: usize) -> Self {
        assert!(remote > 0, "remote pool capacity must be > 0");
        assert!(local > 0, "local pool capacity must be > 0");
        self.remote_pool_size = remote;
        self.local_pool_size = local;
        self
    }
}
