//! Tile-geometry helper.
//!
//! Translates a clip rectangle at a requested downsample into the
//! tile-aligned [`RegionRequest`]s covering it. The requested downsample is
//! snapped to the server's closest preferred level at or below it, so the
//! produced requests always correspond to tiles the server can read without
//! upsampling.

use crate::region::{ImageRegion, RegionRequest};
use crate::server::ImageServer;

/// Snaps a requested downsample to the server's preferred levels.
///
/// Returns the largest preferred downsample that does not exceed the
/// request, or the finest available level if every level is coarser than
/// the request. NaN levels are ignored; an empty level list yields 1.
pub fn preferred_downsample(downsamples: &[f64], requested: f64) -> f64 {
    let mut best_below: Option<f64> = None;
    let mut finest: Option<f64> = None;
    for &d in downsamples {
        if d.is_nan() || d <= 0.0 {
            continue;
        }
        if finest.map_or(true, |f| d < f) {
            finest = Some(d);
        }
        if d <= requested && best_below.map_or(true, |b| d > b) {
            best_below = Some(d);
        }
    }
    best_below.or(finest).unwrap_or(1.0)
}

/// Appends every tile-aligned request intersecting `clip` at the given
/// downsample, z and t to `requests`.
///
/// Tiles are enumerated row-major over the grid of the snapped level,
/// clamped to the image bounds. Requests already present in `requests` are
/// not appended again, so repeated calls over overlapping levels stay
/// duplicate-free.
pub fn tiles_to_request<T>(
    server: &dyn ImageServer<T>,
    clip: &ImageRegion,
    downsample: f64,
    z: i32,
    t: i32,
    requests: &mut Vec<RegionRequest>,
) {
    let downsample = preferred_downsample(&server.preferred_downsamples(), downsample);

    let image_bounds = ImageRegion::new(0, 0, server.width(), server.height());
    let Some(clip) = clip.intersection(&image_bounds) else {
        return;
    };

    // Tile extents in full-resolution coordinates
    let tile_w = ((server.tile_width() as f64) * downsample).round().max(1.0) as i64;
    let tile_h = ((server.tile_height() as f64) * downsample).round().max(1.0) as i64;

    let col0 = (clip.x as i64).div_euclid(tile_w);
    let col1 = ((clip.x + clip.width - 1) as i64).div_euclid(tile_w);
    let row0 = (clip.y as i64).div_euclid(tile_h);
    let row1 = ((clip.y + clip.height - 1) as i64).div_euclid(tile_h);

    for row in row0..=row1 {
        for col in col0..=col1 {
            let x = (col * tile_w) as i32;
            let y = (row * tile_h) as i32;
            let width = (tile_w as i32).min(server.width() - x);
            let height = (tile_h as i32).min(server.height() - y);
            if width <= 0 || height <= 0 {
                continue;
            }
            let request =
                RegionRequest::new(server.path(), downsample, x, y, width, height, z, t);
            if !requests.contains(&request) {
                requests.push(request);
            }
        }
    }
}
