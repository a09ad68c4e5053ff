use facescan_3d::{
    linalg::LinalgError, pointcloud::PointCloud, pointcloud::PointCloudError,
    transforms::RigidTransform,
};

/// Error types for pairwise registration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistrationError {
    /// A cloud has too few points to constrain a rigid transform
    #[error("Not enough points to register (source {source_len}, target {target_len})")]
    NotEnoughPoints {
        /// Points in the source cloud.
        source_len: usize,
        /// Points in the target cloud.
        target_len: usize,
    },

    /// No source point has a target neighbour inside the correspondence distance
    #[error("No correspondences within {0} mm")]
    NoCorrespondences(f64),

    /// The normal equations could not be solved
    #[error(transparent)]
    Linalg(#[from] LinalgError),

    /// The point cloud could not be built
    #[error(transparent)]
    PointCloud(#[from] PointCloudError),
}

/// Result of registering a source cloud onto a target cloud.
///
/// The transformation maps source coordinates into the target frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PairRegistrationResult {
    /// Estimated source to target transform.
    pub transform: RigidTransform,
    /// Fraction of source points with a target correspondence, in `[0, 1]`.
    pub fitness: f64,
    /// Root mean squared distance of the correspondences, in millimeters.
    pub inlier_rmse: f64,
    /// 6x6 information matrix of the transform in the `[ω; v]` tangent order.
    pub information: [[f64; 6]; 6],
    /// Total number of iterations performed.
    pub num_iterations: usize,
}

impl PairRegistrationResult {
    /// The scalar confidence of the registration.
    pub fn confidence(&self) -> f64 {
        self.fitness
    }
}

/// A pairwise rigid registration capability.
///
/// Implementations read both clouds and return the transform mapping `source` onto
/// `target`, starting from `initial`.
pub trait PairRegistration: Send + Sync {
    /// Register `source` onto `target`.
    fn register_pair(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        initial: &RigidTransform,
    ) -> Result<PairRegistrationResult, RegistrationError>;
}
