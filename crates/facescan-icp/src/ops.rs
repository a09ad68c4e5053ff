use glam::DVec3;

use facescan_3d::{neighbors::NeighborIndex, transforms::RigidTransform};

/// A source point matched to its closest target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into the source points.
    pub source: usize,
    /// Index into the target points.
    pub target: usize,
    /// Squared distance between the matched points.
    pub distance_squared: f64,
}

/// Match every source point to its nearest target point, keeping pairs closer than
/// `max_distance`.
pub fn find_correspondences(
    source: &[[f64; 3]],
    target_index: &NeighborIndex,
    max_distance: f64,
) -> Vec<Correspondence> {
    let max_distance_squared = max_distance * max_distance;
    source
        .iter()
        .enumerate()
        .filter_map(|(i, p)| {
            let nn = target_index.nearest(p)?;
            (nn.distance_squared <= max_distance_squared).then_some(Correspondence {
                source: i,
                target: nn.index,
                distance_squared: nn.distance_squared,
            })
        })
        .collect()
}

/// Fitness and inlier RMSE of a set of correspondences over `num_source` source points.
pub(crate) fn fitness_and_rmse(correspondences: &[Correspondence], num_source: usize) -> (f64, f64) {
    if correspondences.is_empty() || num_source == 0 {
        return (0.0, 0.0);
    }
    let sum = correspondences
        .iter()
        .map(|c| c.distance_squared)
        .sum::<f64>();
    (
        correspondences.len() as f64 / num_source as f64,
        (sum / correspondences.len() as f64).sqrt(),
    )
}

/// Evaluate how well `transform` maps `source` onto `target`.
///
/// Returns the fitness (fraction of source points with a target neighbour closer than
/// `max_distance`) and the RMSE of those distances.
pub fn evaluate_registration(
    source: &[[f64; 3]],
    target: &[[f64; 3]],
    transform: &RigidTransform,
    max_distance: f64,
) -> (f64, f64) {
    let index = NeighborIndex::new(target);
    let transformed = source
        .iter()
        .map(|p| transform.apply(p))
        .collect::<Vec<_>>();
    let correspondences = find_correspondences(&transformed, &index, max_distance);
    fitness_and_rmse(&correspondences, source.len())
}

/// Accumulate `Σ GᵀG` over target points, where `G = [-[q]× | I]` is the Jacobian of a
/// left SE(3) perturbation of the point `q`.
pub fn information_matrix<'a>(points: impl IntoIterator<Item = &'a [f64; 3]>) -> [[f64; 6]; 6] {
    let mut info = [[0.0; 6]; 6];
    for q in points {
        let q = DVec3::from_array(*q);
        let rows = [
            [0.0, q.z, -q.y, 1.0, 0.0, 0.0],
            [-q.z, 0.0, q.x, 0.0, 1.0, 0.0],
            [q.y, -q.x, 0.0, 0.0, 0.0, 1.0],
        ];
        for g in rows.iter() {
            for i in 0..6 {
                for j in 0..6 {
                    info[i][j] += g[i] * g[j];
                }
            }
        }
    }
    info
}
