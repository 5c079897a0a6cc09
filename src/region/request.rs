//! Region identification types.
//!
//! A [`RegionRequest`] names one rectangular region of one image server at a
//! specific resolution and (z, t) plane. It is the key type for the tile
//! cache and the waiting map, so equality and hashing must be exact: two
//! requests are equal iff every field is equal, with the downsample compared
//! by bit pattern so that equal requests always hash equally.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An axis-aligned pixel rectangle in full-resolution image coordinates.
///
/// Used both as the clip rectangle of a visible-area registration and as
/// the bounds of a [`RegionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    /// Left edge, inclusive.
    pub x: i32,
    /// Top edge, inclusive.
    pub y: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

impl ImageRegion {
    /// Creates a new region.
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns true if the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Returns true if the two regions share at least one pixel.
    pub fn intersects(&self, other: &ImageRegion) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.x + other.width
            && self.x + self.width > other.x
            && self.y < other.y + other.height
            && self.y + self.height > other.y
    }

    /// Returns the intersection of the two regions, or `None` if disjoint.
    pub fn intersection(&self, other: &ImageRegion) -> Option<ImageRegion> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        if x2 > x && y2 > y {
            Some(ImageRegion::new(x, y, x2 - x, y2 - y))
        } else {
            None
        }
    }
}

/// Immutable identifier for one server-region-resolution-plane pair.
///
/// Requests are cheap to clone: the server path is shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RegionRequest {
    path: Arc<str>,
    downsample: f64,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    z: i32,
    t: i32,
}

impl RegionRequest {
    /// Creates a new region request.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<Arc<str>>,
        downsample: f64,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        z: i32,
        t: i32,
    ) -> Self {
        Self {
            path: path.into(),
            downsample,
            x,
            y,
            width,
            height,
            z,
            t,
        }
    }

    /// Opaque identity of the server this request belongs to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Linear scale factor; 1 is native resolution.
    pub fn downsample(&self) -> f64 {
        self.downsample
    }

    /// Left edge in full-resolution coordinates.
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Top edge in full-resolution coordinates.
    pub fn y(&self) -> i32 {
        self.y
    }

    /// Width in full-resolution pixels.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Height in full-resolution pixels.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Z-slice (focal plane) index.
    pub fn z(&self) -> i32 {
        self.z
    }

    /// Timepoint index.
    pub fn t(&self) -> i32 {
        self.t
    }

    /// The spatial bounds of this request.
    pub fn bounds(&self) -> ImageRegion {
        ImageRegion::new(self.x, self.y, self.width, self.height)
    }

    /// Returns true if the two requests refer to the same server and plane
    /// and their rectangles intersect.
    ///
    /// The downsample is deliberately ignored: overlap is used to invalidate
    /// every cached rendition of a repainted area, whatever its resolution.
    pub fn overlaps(&self, other: &RegionRequest) -> bool {
        self.path == other.path
            && self.z == other.z
            && self.t == other.t
            && self.bounds().intersects(&other.bounds())
    }
}

impl PartialEq for RegionRequest {
    fn eq(&self, other: &Self) -> bool {
        self.downsample.to_bits() == other.downsample.to_bits()
            && self.x == other.x
            && self.y == other.y
            && self.width == other.width
            && self.height == other.height
            && self.z == other.z
            && self.t == other.t
            && self.path == other.path
    }
}

impl Eq for RegionRequest {}

impl Hash for RegionRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.downsample.to_bits().hash(state);
        self.x.hash(state);
        self.y.hash(state);
        self.width.hash(state);
        self.height.hash(state);
        self.z.hash(state);
        self.t.hash(state);
    }
}

impl std::fmt::Display for RegionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [ds={}, ({}, {}, {}, {}), z={}, t={}]",
            self.path, self.downsample, self.x, self.y, self.width, self.height, self.z, self.t
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;

    fn request(path: &str, ds: f64, x: i32, y: i32, w: i32, h: i32, z: i32, t: i32) -> RegionRequest {
        RegionRequest::new(path, ds, x, y, w, h, z, t)
    }

    #[test]
    fn equality_over_all_fields() {
        let a = request("sA", 1.0, 0, 0, 256, 256, 0, 0);
        assert_eq!(a, request("sA", 1.0, 0, 0, 256, 256, 0, 0));
        assert_ne!(a, request("sB", 1.0, 0, 0, 256, 256, 0, 0));
        assert_ne!(a, request("sA", 2.0, 0, 0, 256, 256, 0, 0));
        assert_ne!(a, request("sA", 1.0, 256, 0, 256, 256, 0, 0));
        assert_ne!(a, request("sA", 1.0, 0, 0, 256, 256, 1, 0));
        assert_ne!(a, request("sA", 1.0, 0, 0, 256, 256, 0, 1));
    }

    #[test]
    fn equal_requests_hash_equally() {
        fn hash_of(r: &RegionRequest) -> u64 {
            let mut hasher = DefaultHasher::new();
            r.hash(&mut hasher);
            hasher.finish()
        }
        let a = request("sA", 4.0, 1024, 0, 1024, 1024, 2, 0);
        let b = request("sA", 4.0, 1024, 0, 1024, 1024, 2, 0);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn usable_as_set_key() {
        let mut set = HashSet::new();
        set.insert(request("sA", 1.0, 0, 0, 256, 256, 0, 0));
        set.insert(request("sA", 1.0, 0, 0, 256, 256, 0, 0));
        set.insert(request("sA", 1.0, 256, 0, 256, 256, 0, 0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn overlaps_requires_same_server_and_plane() {
        let a = request("sA", 1.0, 0, 0, 256, 256, 0, 0);
        assert!(a.overlaps(&request("sA", 2.0, 128, 128, 256, 256, 0, 0)));
        assert!(!a.overlaps(&request("sB", 1.0, 128, 128, 256, 256, 0, 0)));
        assert!(!a.overlaps(&request("sA", 1.0, 128, 128, 256, 256, 1, 0)));
        assert!(!a.overlaps(&request("sA", 1.0, 128, 128, 256, 256, 0, 1)));
    }

    #[test]
    fn overlaps_excludes_touching_edges() {
        let a = request("sA", 1.0, 0, 0, 256, 256, 0, 0);
        // Adjacent tiles share an edge but no pixels
        assert!(!a.overlaps(&request("sA", 1.0, 256, 0, 256, 256, 0, 0)));
        assert!(!a.overlaps(&request("sA", 1.0, 0, 256, 256, 256, 0, 0)));
    }

    #[test]
    fn region_intersection() {
        let a = ImageRegion::new(0, 0, 100, 100);
        let b = ImageRegion::new(50, 50, 100, 100);
        assert_eq!(a.intersection(&b), Some(ImageRegion::new(50, 50, 50, 50)));
        assert_eq!(a.intersection(&ImageRegion::new(100, 0, 10, 10)), None);
    }

    #[test]
    fn empty_region_never_intersects() {
        let empty = ImageRegion::new(10, 10, 0, 10);
        let full = ImageRegion::new(0, 0, 100, 100);
        assert!(!empty.intersects(&full));
        assert!(!full.intersects(&empty));
    }
}
