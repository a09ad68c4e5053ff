use faer::Mat;
use glam::{DMat3, DVec3};
use serde::{Deserialize, Serialize};

use facescan_3d::{
    filter::voxel_down_sample, linalg::solve_linear_system, neighbors::NeighborIndex,
    normals::estimate_normals, pointcloud::PointCloud, transforms::RigidTransform,
};

use facescan_linalg::svd::symmetric_eigen3;

use crate::ops::{find_correspondences, fitness_and_rmse, information_matrix, Correspondence};
use crate::registration::{PairRegistration, PairRegistrationResult, RegistrationError};

const INITIAL_DAMPING: f64 = 1e-6;

const MIN_DAMPING: f64 = 1e-10;

// damping beyond which no step is tried
const MAX_DAMPING: f64 = 1e10;

// smallest over largest eigenvalue of the normal equation blocks
const DEGENERACY_RATIO: f64 = 1e-10;

/// Parameters of the coarse-to-fine point-to-plane ICP.
///
/// Distances are in millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Correspondence distance of the coarse pass.
    pub coarse_distance: f64,
    /// Correspondence distance of the fine pass, also used for fitness and information.
    pub fine_distance: f64,
    /// Maximum number of iterations per pass.
    pub max_iterations: usize,
    /// Stop when the fitness changes less than this between iterations.
    pub relative_fitness: f64,
    /// Stop when the inlier RMSE changes less than this between iterations.
    pub relative_rmse: f64,
    /// Voxel size used to downsample both clouds, `0` disables downsampling.
    pub voxel_size: f64,
    /// Neighbourhood radius of the target normal estimation.
    pub normal_radius: f64,
    /// Maximum neighbours of the target normal estimation.
    pub normal_max_nn: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            coarse_distance: 30.0,
            fine_distance: 3.0,
            max_iterations: 30,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
            voxel_size: 2.0,
            normal_radius: 4.0,
            normal_max_nn: 30,
        }
    }
}

/// Point-to-plane Iterative Closest Point.
///
/// Each iteration matches every source point to its nearest target point, linearizes the
/// point-to-plane residual `(T·p − q)·n` around the current estimate and applies the
/// damped Gauss-Newton step as a left SE(3) update. Steps that lose correspondences or raise
/// the inlier RMSE are rejected with a stronger damping, and a pass stops when the
/// correspondences leave a motion unconstrained.
#[derive(Debug, Clone, Default)]
pub struct PointToPlaneIcp {
    config: IcpConfig,
}

struct PassOutcome {
    transform: RigidTransform,
    num_iterations: usize,
}

impl PointToPlaneIcp {
    /// Create a new ICP with the given configuration.
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    // one ICP pass at a fixed correspondence distance
    fn run_pass(
        &self,
        source: &[[f64; 3]],
        target: &[[f64; 3]],
        target_normals: &[[f64; 3]],
        target_index: &NeighborIndex,
        initial: RigidTransform,
        max_distance: f64,
    ) -> Result<PassOutcome, RegistrationError> {
        let mut transform = initial;
        let mut current = source
            .iter()
            .map(|p| transform.apply(p))
            .collect::<Vec<_>>();

        let mut correspondences = find_correspondences(&current, target_index, max_distance);
        let (mut fitness, mut rmse) = fitness_and_rmse(&correspondences, source.len());
        let mut num_iterations = 0;
        let mut lambda = INITIAL_DAMPING;

        for i in 0..self.config.max_iterations {
            if correspondences.len() < 6 {
                log::debug!(
                    "icp pass at {max_distance} mm stopped with {} correspondences",
                    correspondences.len()
                );
                break;
            }

            let (jtj, jtr) = normal_equations(&current, target, target_normals, &correspondences);
            if is_degenerate(&jtj) {
                log::debug!(
                    "icp pass at {max_distance} mm stopped: the correspondences do not constrain every motion"
                );
                break;
            }

            let rhs = jtr.map(|v| -v);
            let mut accepted = None;
            while lambda <= MAX_DAMPING {
                let mut damped = Mat::<f64>::zeros(6, 6);
                for r in 0..6 {
                    for c in 0..6 {
                        damped.write(r, c, jtj[r][c]);
                    }
                    damped.write(r, r, jtj[r][r] + lambda * jtj[r][r].max(f64::EPSILON));
                }
                let delta = solve_linear_system(&damped, &rhs)?;
                if delta.iter().all(|d| d.is_finite()) {
                    let xi = [delta[0], delta[1], delta[2], delta[3], delta[4], delta[5]];
                    let update = RigidTransform::exp(&xi);
                    let moved = current.iter().map(|p| update.apply(p)).collect::<Vec<_>>();
                    let moved_correspondences =
                        find_correspondences(&moved, target_index, max_distance);
                    let (new_fitness, new_rmse) =
                        fitness_and_rmse(&moved_correspondences, source.len());

                    // a step may not lose correspondences, nor spread the ones it keeps
                    let improves = moved_correspondences.len() > correspondences.len()
                        || (moved_correspondences.len() == correspondences.len()
                            && new_rmse <= rmse);
                    if improves {
                        accepted = Some((update, moved, moved_correspondences, new_fitness, new_rmse));
                        lambda = (lambda / 10.0).max(MIN_DAMPING);
                        break;
                    }
                }
                lambda *= 10.0;
            }

            let Some((update, moved, moved_correspondences, new_fitness, new_rmse)) = accepted
            else {
                log::debug!("icp pass at {max_distance} mm stopped: no step improves the fit");
                break;
            };
            transform = update.compose(&transform).orthonormalized();
            current = moved;
            correspondences = moved_correspondences;
            num_iterations += 1;
            log::debug!(
                "icp iteration {i} at {max_distance} mm: fitness {new_fitness:.4} rmse {new_rmse:.4}"
            );

            let converged = (new_fitness - fitness).abs() < self.config.relative_fitness
                && (new_rmse - rmse).abs() < self.config.relative_rmse;
            fitness = new_fitness;
            rmse = new_rmse;
            if converged {
                break;
            }
        }

        Ok(PassOutcome {
            transform,
            num_iterations,
        })
    }
}

// Gauss-Newton system `JᵀJ δ = -Jᵀr` of the point-to-plane residuals
fn normal_equations(
    current: &[[f64; 3]],
    target: &[[f64; 3]],
    target_normals: &[[f64; 3]],
    correspondences: &[Correspondence],
) -> ([[f64; 6]; 6], [f64; 6]) {
    let mut jtj = [[0.0; 6]; 6];
    let mut jtr = [0.0; 6];
    for c in correspondences.iter() {
        let p = DVec3::from_array(current[c.source]);
        let q = DVec3::from_array(target[c.target]);
        let n = DVec3::from_array(target_normals[c.target]);
        let residual = (p - q).dot(n);
        let pxn = p.cross(n);
        let jacobian = [pxn.x, pxn.y, pxn.z, n.x, n.y, n.z];
        for r in 0..6 {
            jtr[r] += jacobian[r] * residual;
            for s in 0..6 {
                jtj[r][s] += jacobian[r] * jacobian[s];
            }
        }
    }
    (jtj, jtr)
}

// Whether the rotation or the translation block of `JᵀJ` is rank deficient, as happens when
// every normal points along its own line of sight.
fn is_degenerate(jtj: &[[f64; 6]; 6]) -> bool {
    let block = |offset: usize| {
        DMat3::from_cols_array_2d(&[
            [jtj[offset][offset], jtj[offset][offset + 1], jtj[offset][offset + 2]],
            [jtj[offset + 1][offset], jtj[offset + 1][offset + 1], jtj[offset + 1][offset + 2]],
            [jtj[offset + 2][offset], jtj[offset + 2][offset + 1], jtj[offset + 2][offset + 2]],
        ])
    };
    let (rotation, _) = symmetric_eigen3(&block(0));
    let (translation, _) = symmetric_eigen3(&block(3));
    let largest = rotation.x.max(translation.x);
    largest <= 0.0 || rotation.z.min(translation.z) <= DEGENERACY_RATIO * largest
}

impl PairRegistration for PointToPlaneIcp {
    fn register_pair(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        initial: &RigidTransform,
    ) -> Result<PairRegistrationResult, RegistrationError> {
        let source = voxel_down_sample(source, self.config.voxel_size);
        let target = voxel_down_sample(target, self.config.voxel_size);
        if source.len() < 3 || target.len() < 3 {
            return Err(RegistrationError::NotEnoughPoints {
                source_len: source.len(),
                target_len: target.len(),
            });
        }

        let target_normals = estimate_normals(
            target.points(),
            self.config.normal_radius,
            self.config.normal_max_nn,
        );
        let target_index = NeighborIndex::new(target.points());

        let mut transform = *initial;
        let mut num_iterations = 0;
        for max_distance in [self.config.coarse_distance, self.config.fine_distance] {
            let pass = self.run_pass(
                source.points(),
                target.points(),
                &target_normals,
                &target_index,
                transform,
                max_distance,
            )?;
            transform = pass.transform;
            num_iterations += pass.num_iterations;
        }

        let transformed = source
            .points()
            .iter()
            .map(|p| transform.apply(p))
            .collect::<Vec<_>>();
        let correspondences =
            find_correspondences(&transformed, &target_index, self.config.fine_distance);
        if correspondences.is_empty() {
            return Err(RegistrationError::NoCorrespondences(
                self.config.fine_distance,
            ));
        }
        let (fitness, inlier_rmse) = fitness_and_rmse(&correspondences, source.len());
        let information = information_matrix(
            correspondences
                .iter()
                .map(|c| &target.points()[c.target]),
        );

        log::debug!(
            "icp registered {} onto {} points: fitness {fitness:.4} rmse {inlier_rmse:.4} after {num_iterations} iterations",
            source.len(),
            target.len()
        );

        Ok(PairRegistrationResult {
            transform,
            fitness,
            inlier_rmse,
            information,
            num_iterations,
        })
    }
}
