use std::ops::Range;
use std::path::Path;

use facescan_3d::{
    frame::ChannelOrder,
    io::ply::{write_ply_ascii, PlyError},
    pointcloud::PointCloud,
};

/// The points one view contributed to a merged cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSegment {
    /// Capture index of the view.
    pub view: usize,
    /// Range of the view's points in the merged cloud.
    pub range: Range<usize>,
}

/// The union of every registered view, in the reference view's frame.
///
/// Views are appended in capture order without deduplication. Colors keep the channel
/// order the cloud was created with; [`MergedPointCloud::write_ply`] reorders them to RGBA.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPointCloud {
    cloud: PointCloud,
    segments: Vec<ViewSegment>,
}

impl Default for MergedPointCloud {
    fn default() -> Self {
        Self {
            cloud: PointCloud::with_capacity(0, ChannelOrder::Rgba),
            segments: Vec::new(),
        }
    }
}

impl MergedPointCloud {
    /// Create an empty merged cloud with room for `capacity` points, storing colors in
    /// `channel_order`.
    pub fn with_capacity(capacity: usize, channel_order: ChannelOrder) -> Self {
        Self {
            cloud: PointCloud::with_capacity(capacity, channel_order),
            segments: Vec::new(),
        }
    }

    /// Append the points of `view`, already in the reference frame.
    ///
    /// Colors in another channel order are converted to the cloud's order.
    pub fn append_view(&mut self, view: usize, points: &PointCloud) {
        let start = self.cloud.len();
        self.cloud.extend_from(points);
        self.segments.push(ViewSegment {
            view,
            range: start..self.cloud.len(),
        });
    }

    /// The merged points.
    pub fn cloud(&self) -> &PointCloud {
        &self.cloud
    }

    /// Take the merged points.
    pub fn into_cloud(self) -> PointCloud {
        self.cloud
    }

    /// Number of merged points.
    pub fn len(&self) -> usize {
        self.cloud.len()
    }

    /// Whether no point was merged.
    pub fn is_empty(&self) -> bool {
        self.cloud.is_empty()
    }

    /// Where each merged view's points are, in merge order.
    pub fn segments(&self) -> &[ViewSegment] {
        &self.segments
    }

    /// Capture indices of the merged views.
    pub fn views(&self) -> impl Iterator<Item = usize> + '_ {
        self.segments.iter().map(|s| s.view)
    }

    /// The merged positions of one view, `None` if it was not merged.
    pub fn view_points(&self, view: usize) -> Option<&[[f64; 3]]> {
        self.segments
            .iter()
            .find(|s| s.view == view)
            .map(|s| &self.cloud.points()[s.range.clone()])
    }

    /// Export the merged cloud as ASCII PLY with RGBA colors.
    pub fn write_ply(&self, path: impl AsRef<Path>) -> Result<(), PlyError> {
        write_ply_ascii(path, &self.cloud)?;
        log::info!("wrote {} merged points", self.cloud.len());
        Ok(())
    }
}
