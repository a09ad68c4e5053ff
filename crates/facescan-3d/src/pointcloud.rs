use crate::frame::ChannelOrder;
use crate::linalg::{self, LinalgError};
use crate::transforms::RigidTransform;

/// Error types for point clouds.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PointCloudError {
    /// A per-point attribute does not have one entry per point
    #[error("Attribute {0} has {1} entries but the cloud has {2} points")]
    AttributeLength(&'static str, usize, usize),
}

/// A single colored point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3D {
    /// Position in millimeters.
    pub position: [f64; 3],
    /// Color in the channel order of the cloud it came from.
    pub color: [u8; 4],
}

/// A colored point cloud.
///
/// Points keep insertion order, so indices stay in parity with any parallel arrays built
/// alongside the cloud. Colors are stored as produced by the sensor together with their
/// channel order; consumers that need a fixed order convert through
/// [`PointCloud::rgba`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    // The points in the point cloud.
    points: Vec<[f64; 3]>,
    // The colors of the points.
    colors: Vec<[u8; 4]>,
    // The byte order of the colors.
    channel_order: ChannelOrder,
    // The normals of the points.
    normals: Option<Vec<[f64; 3]>>,
}

impl PointCloud {
    /// Create a new point cloud from points and their colors.
    pub fn new(
        points: Vec<[f64; 3]>,
        colors: Vec<[u8; 4]>,
        channel_order: ChannelOrder,
    ) -> Result<Self, PointCloudError> {
        if colors.len() != points.len() {
            return Err(PointCloudError::AttributeLength(
                "colors",
                colors.len(),
                points.len(),
            ));
        }
        Ok(Self {
            points,
            colors,
            channel_order,
            normals: None,
        })
    }

    /// Create an opaque white point cloud from positions only.
    pub fn from_points(points: Vec<[f64; 3]>) -> Self {
        let colors = vec![[255; 4]; points.len()];
        Self {
            points,
            colors,
            channel_order: ChannelOrder::Rgba,
            normals: None,
        }
    }

    /// Create an empty point cloud with room for `capacity` points.
    pub fn with_capacity(capacity: usize, channel_order: ChannelOrder) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
            colors: Vec::with_capacity(capacity),
            channel_order,
            normals: None,
        }
    }

    /// Attach per-point normals.
    pub fn with_normals(mut self, normals: Vec<[f64; 3]>) -> Result<Self, PointCloudError> {
        self.set_normals(normals)?;
        Ok(self)
    }

    /// Replace the per-point normals.
    pub fn set_normals(&mut self, normals: Vec<[f64; 3]>) -> Result<(), PointCloudError> {
        if normals.len() != self.points.len() {
            return Err(PointCloudError::AttributeLength(
                "normals",
                normals.len(),
                self.points.len(),
            ));
        }
        self.normals = Some(normals);
        Ok(())
    }

    /// Append a point. Any normals are dropped, since the new point has none.
    pub fn push(&mut self, position: [f64; 3], color: [u8; 4]) {
        self.points.push(position);
        self.colors.push(color);
        self.normals = None;
    }

    /// Get the number of points in the point cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Get as reference the points in the point cloud.
    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    /// Get as reference the colors of the points in the point cloud.
    pub fn colors(&self) -> &[[u8; 4]] {
        &self.colors
    }

    /// The byte order of [`PointCloud::colors`].
    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    /// Get as reference the normals of the points in the point cloud.
    pub fn normals(&self) -> Option<&[[f64; 3]]> {
        self.normals.as_deref()
    }

    /// The point at `index`.
    pub fn get(&self, index: usize) -> Option<Point3D> {
        Some(Point3D {
            position: *self.points.get(index)?,
            color: self.colors[index],
        })
    }

    /// Iterate over the points in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = Point3D> + '_ {
        self.points
            .iter()
            .zip(self.colors.iter())
            .map(|(position, color)| Point3D {
                position: *position,
                color: *color,
            })
    }

    /// The colors reordered to RGBA.
    pub fn rgba(&self) -> impl Iterator<Item = [u8; 4]> + '_ {
        self.colors.iter().map(|c| self.channel_order.to_rgba(*c))
    }

    /// Append every point of `other`, converting its colors to this cloud's order.
    ///
    /// Normals survive only when both clouds carry them.
    pub fn extend_from(&mut self, other: &PointCloud) {
        let keep_normals = match (&self.normals, &other.normals) {
            (Some(_), Some(_)) => true,
            (None, _) => self.points.is_empty() && other.normals.is_some(),
            _ => false,
        };
        let normals = if keep_normals {
            let mut normals = self.normals.take().unwrap_or_default();
            normals.extend_from_slice(other.normals.as_deref().unwrap_or_default());
            Some(normals)
        } else {
            None
        };

        self.points.extend_from_slice(&other.points);
        self.colors.extend(
            other
                .colors
                .iter()
                .map(|c| other.channel_order.convert(*c, self.channel_order)),
        );
        self.normals = normals;
    }

    /// A new cloud holding the points at `indices`, in the given order.
    ///
    /// PRECONDITION: every index is smaller than [`PointCloud::len`].
    pub fn select(&self, indices: &[usize]) -> PointCloud {
        PointCloud {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            colors: indices.iter().map(|&i| self.colors[i]).collect(),
            channel_order: self.channel_order,
            normals: self
                .normals
                .as_ref()
                .map(|normals| indices.iter().map(|&i| normals[i]).collect()),
        }
    }

    /// A copy of the cloud with every point mapped through `transform`.
    ///
    /// Normals are rotated; colors are untouched.
    pub fn transformed(&self, transform: &RigidTransform) -> Result<PointCloud, LinalgError> {
        let rotation = transform.rotation_rows();
        let translation = transform.translation.to_array();

        let mut points = vec![[0.0; 3]; self.points.len()];
        linalg::transform_points(&self.points, &rotation, &translation, &mut points)?;

        let normals = match &self.normals {
            Some(normals) => {
                let mut rotated = vec![[0.0; 3]; normals.len()];
                linalg::transform_points(normals, &rotation, &[0.0; 3], &mut rotated)?;
                Some(rotated)
            }
            None => None,
        };

        Ok(PointCloud {
            points,
            colors: self.colors.clone(),
            channel_order: self.channel_order,
            normals,
        })
    }

    /// The arithmetic mean of the points, `None` when empty.
    pub fn centroid(&self) -> Option<[f64; 3]> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self.points.iter().fold([0.0; 3], |acc, p| {
            [acc[0] + p[0], acc[1] + p[1], acc[2] + p[2]]
        });
        let n = self.points.len() as f64;
        Some([sum[0] / n, sum[1] / n, sum[2] / n])
    }

    /// The axis aligned bounding box as `(min, max)`, `None` when empty.
    pub fn bounds(&self) -> Option<([f64; 3], [f64; 3])> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (
                [lo[0].min(p[0]), lo[1].min(p[1]), lo[2].min(p[2])],
                [hi[0].max(p[0]), hi[1].max(p[1]), hi[2].max(p[2])],
            )
        }))
    }
}
