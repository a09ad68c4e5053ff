use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::camera::CameraIntrinsics;
use crate::frame::{ColorFrame, DepthFrame, FrameError};
use crate::pointcloud::PointCloud;

/// Accepted depth interval in millimeters, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthRange {
    /// Closest accepted depth.
    pub min_depth: f64,
    /// Farthest accepted depth.
    pub max_depth: f64,
}

impl Default for DepthRange {
    /// A face at arm's length.
    fn default() -> Self {
        Self {
            min_depth: 1.0,
            max_depth: 1000.0,
        }
    }
}

impl DepthRange {
    /// The tighter band used to cull live preview frames.
    pub const PREVIEW: DepthRange = DepthRange {
        min_depth: 200.0,
        max_depth: 800.0,
    };

    /// Create a new depth range.
    pub fn new(min_depth: f64, max_depth: f64) -> Self {
        Self {
            min_depth,
            max_depth,
        }
    }

    /// Whether `depth` is a valid sample inside the range.
    ///
    /// `NaN` and `0.0` are the sensor's invalid-depth sentinels and are always rejected.
    #[inline]
    pub fn contains(&self, depth: f64) -> bool {
        depth.is_finite() && depth != 0.0 && depth >= self.min_depth && depth <= self.max_depth
    }
}

/// Unproject a depth frame into a colored point cloud in camera space.
///
/// The color frame is resampled onto the depth grid when the resolutions differ. One point
/// is emitted per accepted depth pixel, in raster order, carrying the color in the color
/// frame's channel order.
///
/// # Arguments
///
/// * `depth` - Depth map in millimeters.
/// * `color` - Color frame of any resolution covering the same field of view.
/// * `intrinsics` - Intrinsics at the resolution of the depth map.
/// * `range` - Accepted depth interval.
pub fn unproject_frame(
    depth: &DepthFrame,
    color: &ColorFrame,
    intrinsics: &CameraIntrinsics,
    range: &DepthRange,
) -> Result<PointCloud, FrameError> {
    let color = color.resize_nearest(depth.size())?;
    let width = depth.width();

    let rows = depth
        .as_slice()
        .par_chunks_exact(width)
        .zip(color.as_slice().par_chunks_exact(width))
        .enumerate()
        .map(|(py, (depth_row, color_row))| {
            depth_row
                .iter()
                .zip(color_row.iter())
                .enumerate()
                .filter(|(_, (d, _))| range.contains(**d as f64))
                .map(|(px, (d, c))| (intrinsics.unproject(px as f64, py as f64, *d as f64), *c))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let num_points = rows.iter().map(Vec::len).sum();
    let mut cloud = PointCloud::with_capacity(num_points, color.channel_order());
    for (point, color) in rows.into_iter().flatten() {
        cloud.push(point, color);
    }

    log::debug!(
        "unprojected {}/{} depth pixels",
        cloud.len(),
        depth.size().num_pixels()
    );

    Ok(cloud)
}

/// Lift 2D landmarks to camera space using the depth under each landmark.
///
/// Each landmark is rounded to the nearest depth pixel. Landmarks outside the frame or over
/// an invalid or out-of-range depth yield `None`, so the output stays index-aligned with
/// the input.
pub fn lift_landmarks(
    points_2d: &[[f64; 2]],
    depth: &DepthFrame,
    intrinsics: &CameraIntrinsics,
    range: &DepthRange,
) -> Vec<Option<[f64; 3]>> {
    points_2d
        .iter()
        .map(|&[u, v]| {
            if !(u.is_finite() && v.is_finite()) {
                return None;
            }
            let (px, py) = (u.round() as i64, v.round() as i64);
            let d = depth.get_checked(px, py)? as f64;
            range
                .contains(d)
                .then(|| intrinsics.unproject(px as f64, py as f64, d))
        })
        .collect()
}
