//! Interfaces the store consumes and exposes.
//!
//! An [`ImageServer`] is the backend the store reads tiles from: it reports
//! pyramid geometry synchronously and performs region reads asynchronously.
//! Servers whose tiles are synthesised cheaply in-process report
//! [`ImageServer::is_generating`] and are routed to the local executor pool
//! instead of the remote one.
//!
//! [`TileListener`] receives "tile available" notifications after a tile
//! lands in the cache; [`SizeEstimator`] supplies the byte weight the cache
//! charges for each tile.

use async_trait::async_trait;

use crate::error::RegionStoreError;
use crate::region::RegionRequest;

/// A source of image tiles for one multi-resolution image.
///
/// Metadata accessors must be cheap; [`read_region`](ImageServer::read_region)
/// may be arbitrarily slow (disk, network) and is always called from an
/// executor pool, never from a caller thread.
#[async_trait]
pub trait ImageServer<T>: Send + Sync {
    /// Opaque identity. Two servers with equal paths address the same image.
    fn path(&self) -> &str;

    /// Full-resolution image width in pixels.
    fn width(&self) -> i32;

    /// Full-resolution image height in pixels.
    fn height(&self) -> i32;

    /// Number of precomputed resolution levels. More than one makes the
    /// server pyramidal.
    fn n_resolutions(&self) -> usize;

    /// Number of Z slices (focal planes).
    fn n_z_slices(&self) -> i32;

    /// Number of timepoints.
    fn n_timepoints(&self) -> i32 {
        1
    }

    /// Downsample factors of the available resolution levels, native first
    /// is not required; order is unspecified.
    fn preferred_downsamples(&self) -> Vec<f64>;

    /// Width of the tile grid cells, in level pixels.
    fn tile_width(&self) -> i32;

    /// Height of the tile grid cells, in level pixels.
    fn tile_height(&self) -> i32;

    /// Cheap predicate: true means [`read_region`](ImageServer::read_region)
    /// would produce nothing for this request. Re-tested on every cache miss
    /// rather than memoised.
    fn is_empty_region(&self, _request: &RegionRequest) -> bool {
        false
    }

    /// Capability tag: true when tiles are synthesised cheaply in-process.
    /// Generating servers are dispatched to the local pool so slow remote
    /// reads cannot starve them.
    fn is_generating(&self) -> bool {
        false
    }

    /// Reads one region. `Ok(None)` means the region holds no image data
    /// and is treated the same as an empty read by the store.
    async fn read_region(&self, request: &RegionRequest) -> Result<Option<T>, RegionStoreError>;
}

/// Receives notifications when a tile has been inserted into the cache.
///
/// The tile is already visible in the cache when this fires. Listener
/// identity (for registration replacement and removal) is `Arc` pointer
/// identity.
pub trait TileListener<T>: Send + Sync {
    /// Called once per cache insertion of `tile` for `request`.
    fn tile_available(&self, server_path: &str, request: &RegionRequest, tile: &T);
}

/// Estimates the in-memory size of a tile, in bytes.
pub trait SizeEstimator<T>: Send + Sync {
    /// Approximate byte size of `tile`. Need not be exact; it is the weight
    /// the cache charges against its budget.
    fn approx_size(&self, tile: &T) -> u64;
}
