use glam::{DMat3, DVec3};
use rayon::prelude::*;

use facescan_linalg::svd::symmetric_eigen3;

use crate::neighbors::NeighborIndex;
use crate::pointcloud::{PointCloud, PointCloudError};

/// Estimate a unit normal for every point.
///
/// The normal is the direction of least variance of the point's neighbourhood (the closest
/// `max_nn` points within `radius`), flipped to face the camera at the origin. Points with
/// fewer than three neighbours fall back to the direction towards the camera.
pub fn estimate_normals(points: &[[f64; 3]], radius: f64, max_nn: usize) -> Vec<[f64; 3]> {
    let index = NeighborIndex::new(points);
    points
        .par_iter()
        .map(|point| {
            let neighbours = index.within_knn(point, radius, max_nn);
            let normal = if neighbours.len() < 3 {
                None
            } else {
                let neighbourhood = neighbours
                    .iter()
                    .map(|nn| DVec3::from_array(points[nn.index]))
                    .collect::<Vec<_>>();
                plane_normal(&neighbourhood)
            };
            orient_towards_camera(normal, DVec3::from_array(*point)).to_array()
        })
        .collect()
}

/// Estimate normals and attach them to the cloud.
pub fn with_estimated_normals(
    cloud: PointCloud,
    radius: f64,
    max_nn: usize,
) -> Result<PointCloud, PointCloudError> {
    let normals = estimate_normals(cloud.points(), radius, max_nn);
    cloud.with_normals(normals)
}

/// The unit normal of the best fitting plane, `None` for degenerate neighbourhoods.
pub fn plane_normal(points: &[DVec3]) -> Option<DVec3> {
    if points.len() < 3 {
        return None;
    }
    let centroid = points.iter().copied().sum::<DVec3>() / points.len() as f64;
    let covariance = points.iter().fold(DMat3::ZERO, |acc, p| {
        let d = *p - centroid;
        acc + DMat3::from_cols(d * d.x, d * d.y, d * d.z)
    });

    let (values, vectors) = symmetric_eigen3(&covariance);
    // a line or a single point has no well defined plane
    if values.y <= 1e-12 * values.x.max(f64::MIN_POSITIVE) {
        return None;
    }
    vectors.z_axis.try_normalize()
}

fn orient_towards_camera(normal: Option<DVec3>, point: DVec3) -> DVec3 {
    let to_camera = (-point).try_normalize().unwrap_or(DVec3::NEG_Z);
    match normal {
        Some(n) if n.dot(to_camera) < 0.0 => -n,
        Some(n) => n,
        None => to_camera,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn plane_grid(z: f64) -> Vec<[f64; 3]> {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                points.push([i as f64 * 2.0 - 9.0, j as f64 * 2.0 - 9.0, z]);
            }
        }
        points
    }

    #[test]
    fn test_plane_normals_face_camera() {
        let points = plane_grid(400.0);
        let normals = estimate_normals(&points, 5.0, 30);
        assert_eq!(normals.len(), points.len());
        for n in normals {
            assert_relative_eq!(n[0], 0.0, epsilon = 1e-9);
            assert_relative_eq!(n[1], 0.0, epsilon = 1e-9);
            assert_relative_eq!(n[2], -1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_tilted_plane() {
        // plane z = 400 + x, normal ∝ (1, 0, -1)
        let points = plane_grid(0.0)
            .into_iter()
            .map(|p| [p[0], p[1], 400.0 + p[0]])
            .collect::<Vec<_>>();
        let normals = estimate_normals(&points, 6.0, 30);
        let expected = DVec3::new(1.0, 0.0, -1.0).normalize();
        for n in normals {
            assert!(DVec3::from_array(n).abs_diff_eq(expected, 1e-9), "{n:?}");
        }
    }

    #[test]
    fn test_isolated_points_get_viewing_direction() {
        let points = vec![[0.0, 0.0, 500.0], [300.0, 0.0, 400.0]];
        let normals = estimate_normals(&points, 1.0, 10);
        assert_eq!(normals[0], [0.0, 0.0, -1.0]);
        assert_relative_eq!(normals[1][0], -0.6, epsilon = 1e-12);
        assert_relative_eq!(normals[1][2], -0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_collinear_neighbourhood_is_degenerate() {
        let line = (0..5)
            .map(|i| DVec3::new(i as f64, 0.0, 400.0))
            .collect::<Vec<_>>();
        assert_eq!(plane_normal(&line), None);
    }

    #[test]
    fn test_with_estimated_normals() -> Result<(), PointCloudError> {
        let cloud = with_estimated_normals(PointCloud::from_points(plane_grid(300.0)), 5.0, 30)?;
        assert_eq!(cloud.normals().map(|n| n.len()), Some(100));
        Ok(())
    }
}
