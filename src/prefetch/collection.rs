//! Per-registration prefetch collections.
//!
//! A [`TileRequestCollection`] holds the ordered tile requests covering one
//! viewer's visible area. Requests are enumerated per resolution level from
//! the coarsest downward and consumed from the **back** of the list, so the
//! finest tiles are dispatched first. Once the current focal plane drains,
//! the collection widens to `z ± k` neighbours at a degraded downsample
//! until the configured Z horizon is reached.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::region::tiles::tiles_to_request;
use crate::region::{ImageRegion, RegionRequest};
use crate::server::{ImageServer, TileListener};

/// Ordered tile requests for one (listener, clip, plane) registration.
pub(crate) struct TileRequestCollection<T> {
    listener: Arc<dyn TileListener<T>>,
    server: Arc<dyn ImageServer<T>>,
    clip: ImageRegion,
    downsample: f64,
    z: i32,
    t: i32,
    /// Registration time; breaks priority ties, older first.
    timestamp: Instant,
    z_separation: i32,
    max_z_separation: i32,
    /// Pending requests, consumed from the back (finest first).
    pending: Vec<RegionRequest>,
}

impl<T> TileRequestCollection<T> {
    pub(crate) fn new(
        listener: Arc<dyn TileListener<T>>,
        server: Arc<dyn ImageServer<T>>,
        clip: ImageRegion,
        downsample: f64,
        z: i32,
        t: i32,
        max_z_separation: i32,
    ) -> Self {
        let max_z_separation = (server.n_z_slices() - 1).min(max_z_separation).max(0);
        let mut collection = Self {
            listener,
            server,
            clip,
            downsample,
            z,
            t,
            timestamp: Instant::now(),
            z_separation: 0,
            max_z_separation,
            pending: Vec::new(),
        };
        collection.update_requests();
        collection
    }

    pub(crate) fn server(&self) -> &Arc<dyn ImageServer<T>> {
        &self.server
    }

    /// Distance from the focal plane currently being enumerated.
    pub(crate) fn z_separation(&self) -> i32 {
        self.z_separation
    }

    pub(crate) fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// True if this collection was registered by `listener` (pointer
    /// identity).
    pub(crate) fn matches_listener(&self, listener: &Arc<dyn TileListener<T>>) -> bool {
        Arc::ptr_eq(&self.listener, listener)
    }

    /// True if a new registration with these parameters would be identical.
    pub(crate) fn same_registration(&self, clip: &ImageRegion, z: i32, t: i32) -> bool {
        self.clip == *clip && self.z == z && self.t == t
    }

    pub(crate) fn has_more_tiles(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Removes and returns the tail request.
    ///
    /// Draining the list advances the Z expansion: the next band of
    /// `z ± separation` requests is enumerated, until the horizon.
    pub(crate) fn next_tile_request(&mut self) -> Option<RegionRequest> {
        let request = self.pending.pop()?;
        if self.pending.is_empty() && self.z_separation < self.max_z_separation {
            self.z_separation += 1;
            self.update_requests();
        }
        Some(request)
    }

    fn update_requests(&mut self) {
        if self.z_separation == 0 {
            self.update_requests_for_z(self.z, self.downsample, false);
        } else {
            // Neighbouring planes are only worth prefetching coarsely
            let degraded = self.downsample * f64::from((self.z_separation * 2).max(5));
            if self.z - self.z_separation >= 0 {
                self.update_requests_for_z(self.z - self.z_separation, degraded, true);
            }
            if self.z + self.z_separation < self.server.n_z_slices() {
                self.update_requests_for_z(self.z + self.z_separation, degraded, true);
            }
        }
    }

    /// Appends tile requests for one plane, walking the resolution levels
    /// from coarsest to finest so that the finest tiles sit at the back of
    /// the list and are consumed first.
    ///
    /// Stops after the first level at or below the registered downsample.
    /// With `stop_before_downsample` set, levels at or below it are skipped
    /// entirely (beyond the coarsest), which keeps neighbouring-plane
    /// prefetch to the degraded resolution only.
    fn update_requests_for_z(&mut self, z: i32, downsample: f64, stop_before_downsample: bool) {
        let mut levels = self.server.preferred_downsamples();
        levels.retain(|d| !d.is_nan());
        levels.sort_by(f64::total_cmp);

        let mut first_level = true;
        for &level in levels.iter().rev() {
            if first_level || !stop_before_downsample || level > self.downsample {
                let before = self.pending.len();
                tiles_to_request(
                    self.server.as_ref(),
                    &self.clip,
                    level.max(downsample),
                    z,
                    self.t,
                    &mut self.pending,
                );
                trace!(
                    added = self.pending.len() - before,
                    z_separation = self.z_separation,
                    downsample,
                    level,
                    "enumerated tile requests"
                );
            }
            first_level = false;
            if level <= self.downsample {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegionStoreError;
    use async_trait::async_trait;

    struct PlanesServer {
        n_z: i32,
        downsamples: Vec<f64>,
    }

    #[async_trait]
    impl ImageServer<u8> for PlanesServer {
        fn path(&self) -> &str {
            "planes"
        }
        fn width(&self) -> i32 {
            2048
        }
        fn height(&self) -> i32 {
            2048
        }
        fn n_resolutions(&self) -> usize {
            self.downsamples.len()
        }
        fn n_z_slices(&self) -> i32 {
            self.n_z
        }
        fn preferred_downsamples(&self) -> Vec<f64> {
            self.downsamples.clone()
        }
        fn tile_width(&self) -> i32 {
            256
        }
        fn tile_height(&self) -> i32 {
            256
        }
        async fn read_region(
            &self,
            _request: &RegionRequest,
        ) -> Result<Option<u8>, RegionStoreError> {
            Ok(None)
        }
    }

    struct NullListener;

    impl TileListener<u8> for NullListener {
        fn tile_available(&self, _path: &str, _request: &RegionRequest, _tile: &u8) {}
    }

    fn collection(
        n_z: i32,
        downsamples: Vec<f64>,
        clip: ImageRegion,
        downsample: f64,
        z: i32,
        max_z_separation: i32,
    ) -> TileRequestCollection<u8> {
        let listener: Arc<dyn TileListener<u8>> = Arc::new(NullListener);
        let server: Arc<dyn ImageServer<u8>> = Arc::new(PlanesServer { n_z, downsamples });
        TileRequestCollection::new(listener, server, clip, downsample, z, 0, max_z_separation)
    }

    fn drain_while(collection: &mut TileRequestCollection<u8>, z: i32) -> Vec<RegionRequest> {
        let mut drained = Vec::new();
        while collection
            .pending
            .last()
            .map(|r| r.z() == z)
            .unwrap_or(false)
        {
            drained.push(collection.next_tile_request().unwrap());
        }
        drained
    }

    #[test]
    fn finest_tiles_pop_first() {
        // Enumeration appends coarse levels first; LIFO consumption hands
        // out the finest tiles before the coarse fallbacks.
        let mut c = collection(
            1,
            vec![1.0, 8.0],
            ImageRegion::new(0, 0, 512, 512),
            1.0,
            0,
            0,
        );
        let first = c.next_tile_request().unwrap();
        assert_eq!(first.downsample(), 1.0);

        let mut seen_coarse = false;
        while let Some(request) = c.next_tile_request() {
            if request.downsample() > 1.0 {
                seen_coarse = true;
            } else {
                assert!(!seen_coarse, "fine tile dispensed after a coarse one");
            }
        }
        assert!(seen_coarse);
    }

    #[test]
    fn enumeration_stops_at_registered_downsample() {
        let c = collection(
            1,
            vec![1.0, 4.0, 16.0],
            ImageRegion::new(0, 0, 2048, 2048),
            4.0,
            0,
            0,
        );
        // Levels 16 and 4 are enumerated; level 1 is finer than requested
        assert!(c.pending.iter().all(|r| r.downsample() >= 4.0));
        assert!(c.pending.iter().any(|r| r.downsample() == 16.0));
        assert!(c.pending.iter().any(|r| r.downsample() == 4.0));
    }

    #[test]
    fn identical_registration_detected() {
        let clip = ImageRegion::new(0, 0, 512, 512);
        let c = collection(1, vec![1.0], clip, 1.0, 0, 0);
        assert!(c.same_registration(&clip, 0, 0));
        assert!(!c.same_registration(&ImageRegion::new(0, 0, 256, 256), 0, 0));
        assert!(!c.same_registration(&clip, 1, 0));
        assert!(!c.same_registration(&clip, 0, 1));
    }

    #[test]
    fn listener_identity_not_structural() {
        let listener_a: Arc<dyn TileListener<u8>> = Arc::new(NullListener);
        let listener_b: Arc<dyn TileListener<u8>> = Arc::new(NullListener);
        let server: Arc<dyn ImageServer<u8>> = Arc::new(PlanesServer {
            n_z: 1,
            downsamples: vec![1.0],
        });
        let c = TileRequestCollection::new(
            Arc::clone(&listener_a),
            server,
            ImageRegion::new(0, 0, 256, 256),
            1.0,
            0,
            0,
            0,
        );
        assert!(c.matches_listener(&listener_a));
        assert!(!c.matches_listener(&listener_b));
    }

    #[test]
    fn z_expansion_alternates_outward() {
        // z=5, horizon 2, 11 slices: drain z=5, then z=4/6, then z=3/7
        let mut c = collection(
            11,
            vec![1.0, 4.0],
            ImageRegion::new(0, 0, 512, 512),
            1.0,
            5,
            2,
        );

        let current = drain_while(&mut c, 5);
        assert!(!current.is_empty());
        assert_eq!(c.z_separation(), 1);

        let band: Vec<i32> = c.pending.iter().map(|r| r.z()).collect();
        assert!(band.contains(&4));
        assert!(band.contains(&6));
        assert!(band.iter().all(|&z| z == 4 || z == 6));

        while c.pending.iter().any(|r| r.z() == 4 || r.z() == 6) {
            c.next_tile_request().unwrap();
        }
        assert_eq!(c.z_separation(), 2);
        let band: Vec<i32> = c.pending.iter().map(|r| r.z()).collect();
        assert!(band.contains(&3));
        assert!(band.contains(&7));

        // Horizon reached: draining the last band ends the collection
        while c.next_tile_request().is_some() {}
        assert!(!c.has_more_tiles());
        assert_eq!(c.z_separation(), 2);
    }

    #[test]
    fn z_expansion_uses_degraded_downsample() {
        let mut c = collection(
            11,
            vec![1.0, 2.0, 4.0, 8.0, 16.0],
            ImageRegion::new(0, 0, 2048, 2048),
            1.0,
            5,
            1,
        );
        drain_while(&mut c, 5);

        // Neighbouring planes are requested at downsample * max(5, 2k) = 5,
        // snapped to the preferred level 4
        assert!(!c.pending.is_empty());
        assert!(c.pending.iter().all(|r| r.downsample() >= 4.0));
    }

    #[test]
    fn z_expansion_respects_plane_bounds() {
        // z=0: only z=1 exists on the high side
        let mut c = collection(
            3,
            vec![1.0],
            ImageRegion::new(0, 0, 512, 512),
            1.0,
            0,
            1,
        );
        drain_while(&mut c, 0);
        assert!(c.pending.iter().all(|r| r.z() == 1));
    }

    #[test]
    fn horizon_clamped_to_slice_count() {
        let c = collection(1, vec![1.0], ImageRegion::new(0, 0, 512, 512), 1.0, 0, 10);
        assert_eq!(c.max_z_separation, 0);

        let c = collection(4, vec![1.0], ImageRegion::new(0, 0, 512, 512), 1.0, 0, 10);
        assert_eq!(c.max_z_separation, 3);
    }
}
