use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::neighbors::NeighborIndex;
use crate::pointcloud::PointCloud;

#[derive(Default)]
struct VoxelAccumulator {
    count: usize,
    position: [f64; 3],
    color: [u32; 4],
    normal: [f64; 3],
}

/// Downsample a cloud by averaging the points that fall into the same voxel.
///
/// Positions, colors and normals are averaged per voxel; normals are renormalized. Output
/// points are ordered by voxel coordinate, so the result does not depend on input order.
/// A non-positive `voxel_size` returns the cloud unchanged.
pub fn voxel_down_sample(cloud: &PointCloud, voxel_size: f64) -> PointCloud {
    if voxel_size.is_nan() || voxel_size <= 0.0 || cloud.is_empty() {
        return cloud.clone();
    }

    let mut voxels = BTreeMap::<[i64; 3], VoxelAccumulator>::new();
    for (i, (point, color)) in cloud.points().iter().zip(cloud.colors()).enumerate() {
        let key = point.map(|v| (v / voxel_size).floor() as i64);
        let voxel = voxels.entry(key).or_default();
        voxel.count += 1;
        for k in 0..3 {
            voxel.position[k] += point[k];
        }
        for k in 0..4 {
            voxel.color[k] += color[k] as u32;
        }
        if let Some(normals) = cloud.normals() {
            for k in 0..3 {
                voxel.normal[k] += normals[i][k];
            }
        }
    }

    let mut downsampled = PointCloud::with_capacity(voxels.len(), cloud.channel_order());
    let mut normals = Vec::with_capacity(voxels.len());
    for voxel in voxels.values() {
        let n = voxel.count as f64;
        downsampled.push(
            voxel.position.map(|v| v / n),
            voxel
                .color
                .map(|c| ((c as f64 / n).round() as u32).min(255) as u8),
        );
        let length = voxel.normal.iter().map(|v| v * v).sum::<f64>().sqrt();
        normals.push(if length > 0.0 {
            voxel.normal.map(|v| v / length)
        } else {
            voxel.normal
        });
    }

    if cloud.normals().is_some() {
        if let Err(err) = downsampled.set_normals(normals) {
            log::warn!("dropping normals after downsampling: {err}");
        }
    }

    log::debug!(
        "voxel downsampling {} -> {} points (voxel size {voxel_size})",
        cloud.len(),
        downsampled.len()
    );

    downsampled
}

/// Remove points whose mean distance to their `nb_neighbors` closest neighbours is larger
/// than `mean + std_ratio · std` over the whole cloud.
///
/// Returns the filtered cloud and the indices of the kept points in the input.
pub fn remove_statistical_outliers(
    cloud: &PointCloud,
    nb_neighbors: usize,
    std_ratio: f64,
) -> (PointCloud, Vec<usize>) {
    if nb_neighbors == 0 || cloud.len() <= 1 {
        let all = (0..cloud.len()).collect::<Vec<_>>();
        return (cloud.clone(), all);
    }

    let index = NeighborIndex::new(cloud.points());
    let mean_distances = cloud
        .points()
        .par_iter()
        .enumerate()
        .map(|(i, point)| {
            // the query point is its own closest neighbour
            let neighbours = index
                .knn(point, nb_neighbors + 1)
                .into_iter()
                .filter(|nn| nn.index != i)
                .take(nb_neighbors)
                .collect::<Vec<_>>();
            if neighbours.is_empty() {
                return 0.0;
            }
            neighbours
                .iter()
                .map(|nn| nn.distance_squared.sqrt())
                .sum::<f64>()
                / neighbours.len() as f64
        })
        .collect::<Vec<_>>();

    let n = mean_distances.len() as f64;
    let mean = mean_distances.iter().sum::<f64>() / n;
    let variance = mean_distances
        .iter()
        .map(|d| (d - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0).max(1.0);
    let threshold = mean + std_ratio * variance.sqrt();

    let kept = mean_distances
        .iter()
        .enumerate()
        .filter(|(_, d)| **d <= threshold)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    log::debug!(
        "statistical outlier removal kept {}/{} points",
        kept.len(),
        cloud.len()
    );

    (cloud.select(&kept), kept)
}
