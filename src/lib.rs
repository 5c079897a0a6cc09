//! regionstore - shared tile store for pyramidal image viewers
//!
//! This library provides a memory-bounded cache of rendered image tiles for
//! multi-resolution ("pyramidal") image viewers. Viewers ask for the tiles
//! covering a visible area at a chosen resolution; the store returns cached
//! tiles immediately, deduplicates concurrent fetches of the same region,
//! and prefetches tiles nearby in space, resolution and the Z (focal-plane)
//! axis to keep panning and zooming responsive.
//!
//! # High-level API
//!
//! ```ignore
//! use regionstore::{ImageRegionStore, RegionStoreConfig, ImageRegion};
//!
//! let store = ImageRegionStore::new(Box::new(estimator), RegionStoreConfig::default());
//!
//! // Synchronous cache lookup; never schedules work
//! if let Some(tile) = store.cached_tile(server.as_ref(), &request) {
//!     paint(tile);
//! }
//!
//! // Prefetch the visible area (and nearby planes) for this viewer
//! store.register_request(&listener, &server, visible, downsample, z, t);
//! ```

pub mod cache;
pub mod config;
pub mod error;
mod prefetch;
pub mod region;
pub mod server;
pub mod store;

pub use cache::TileCache;
pub use config::RegionStoreConfig;
pub use error::RegionStoreError;
pub use region::{ImageRegion, RegionRequest};
pub use server::{ImageServer, SizeEstimator, TileListener};
pub use store::{ImageRegionStore, RegionOutcome, TileWorker, WorkerState};

/// Version of the regionstore library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
