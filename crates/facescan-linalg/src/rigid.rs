//! Rigid alignment utilities (Kabsch)
//!
//! Given two corresponding point sets `A` and `B` (same index = same physical point),
//! [`kabsch`] finds the proper rotation `R` (`det(R) = +1`) and translation `t`
//! minimizing `Σ |R·aᵢ + t − bᵢ|²`.
//!
//! For more details, see: Arun, K., Huang, T. S., and Blostein, S. D.
//! "Least-squares fitting of two 3-D point sets." IEEE PAMI, 1987.

use glam::{DMat3, DVec3};
use thiserror::Error;

use crate::svd::svd3;

/// Ratio `σ₂ / σ₁` of the cross-covariance below which the correspondences are
/// considered collinear.
pub const DEGENERACY_RATIO: f64 = 1e-6;

/// Error type for rigid alignment operations.
#[derive(Debug, Error, PartialEq)]
pub enum RigidError {
    /// Source and destination arrays must have the same length
    #[error("Source and destination arrays must have the same length ({0} != {1})")]
    MismatchedInputLengths(usize, usize),

    /// At least three correspondences are required
    #[error("At least 3 correspondences are required, got {0}")]
    NotEnoughPoints(usize),

    /// The correspondences do not determine a unique rotation
    #[error("Degenerate correspondences: points are coincident or collinear (singular values {0:?})")]
    DegenerateInput([f64; 3]),
}

/// The rotation and translation mapping a source point set onto a destination point set.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidFit {
    /// Proper rotation matrix, `det = +1`.
    pub rotation: DMat3,
    /// Translation vector.
    pub translation: DVec3,
    /// Singular values of the cross-covariance matrix, in descending order.
    pub singular_values: DVec3,
    /// Whether the naive `V·Uᵀ` was a reflection and had to be corrected.
    pub reflection_corrected: bool,
    /// Root mean squared residual of the aligned correspondences.
    pub rmse: f64,
}

impl RigidFit {
    /// Apply the fitted transformation to a point.
    #[inline]
    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.translation
    }
}

/// Compute the centroids of two sets of points.
pub fn compute_centroids(points_src: &[[f64; 3]], points_dst: &[[f64; 3]]) -> (DVec3, DVec3) {
    let centroid = |points: &[[f64; 3]]| {
        points
            .iter()
            .fold(DVec3::ZERO, |acc, p| acc + DVec3::from_array(*p))
            / points.len().max(1) as f64
    };
    (centroid(points_src), centroid(points_dst))
}

/// Cross-covariance `H = Σ (aᵢ − ā)(bᵢ − b̄)ᵀ` of two centered point sets.
pub fn cross_covariance(
    points_src: &[[f64; 3]],
    points_dst: &[[f64; 3]],
    src_centroid: DVec3,
    dst_centroid: DVec3,
) -> DMat3 {
    let mut h = DMat3::ZERO;
    for (p_src, p_dst) in points_src.iter().zip(points_dst.iter()) {
        let a = DVec3::from_array(*p_src) - src_centroid;
        let b = DVec3::from_array(*p_dst) - dst_centroid;
        h += DMat3::from_cols(a * b.x, a * b.y, a * b.z);
    }
    h
}

/// Best-fit rotation for a cross-covariance matrix `H = U·S·Vᵀ`.
///
/// Returns `R = V·Uᵀ` and, when that is a reflection (`det < 0`), negates the singular
/// vector of `V` paired with the smallest singular value and recomputes `R`. The boolean
/// reports whether the correction was applied.
pub fn rotation_from_covariance(h: &DMat3) -> (DMat3, DVec3, bool) {
    let svd = svd3(h);
    let u = *svd.u();
    let v = *svd.v();

    let r = v * u.transpose();
    if r.determinant() < 0.0 {
        let v_corrected = DMat3::from_cols(v.x_axis, v.y_axis, -v.z_axis);
        (v_corrected * u.transpose(), svd.singular_values(), true)
    } else {
        (r, svd.singular_values(), false)
    }
}

/// Kabsch algorithm: least-squares rigid transformation mapping `points_src` onto
/// `points_dst`.
///
/// # Arguments
///
/// * `points_src` - Source points `A`.
/// * `points_dst` - Destination points `B`, `B[i]` corresponding to `A[i]`.
///
/// # Errors
///
/// Fails when the lengths differ, when fewer than three correspondences are given or
/// when the correspondences are coincident or collinear.
///
/// # Example
///
/// ```
/// use facescan_linalg::rigid::kabsch;
///
/// let src = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
/// let dst = [[1.0, 2.0, 3.0], [2.0, 2.0, 3.0], [1.0, 3.0, 3.0]];
/// let fit = kabsch(&src, &dst).unwrap();
/// assert!((fit.translation.x - 1.0).abs() < 1e-9);
/// ```
pub fn kabsch(points_src: &[[f64; 3]], points_dst: &[[f64; 3]]) -> Result<RigidFit, RigidError> {
    if points_src.len() != points_dst.len() {
        return Err(RigidError::MismatchedInputLengths(
            points_src.len(),
            points_dst.len(),
        ));
    }
    if points_src.len() < 3 {
        return Err(RigidError::NotEnoughPoints(points_src.len()));
    }

    let (src_centroid, dst_centroid) = compute_centroids(points_src, points_dst);
    let h = cross_covariance(points_src, points_dst, src_centroid, dst_centroid);

    let (rotation, singular_values, reflection_corrected) = rotation_from_covariance(&h);

    // rank(H) < 2 leaves the rotation about the common line undetermined
    if singular_values.x <= f64::EPSILON || singular_values.y <= DEGENERACY_RATIO * singular_values.x
    {
        return Err(RigidError::DegenerateInput(singular_values.to_array()));
    }

    let translation = dst_centroid - rotation * src_centroid;

    let sq_error = points_src
        .iter()
        .zip(points_dst.iter())
        .map(|(a, b)| {
            (rotation * DVec3::from_array(*a) + translation - DVec3::from_array(*b))
                .length_squared()
        })
        .sum::<f64>();

    Ok(RigidFit {
        rotation,
        translation,
        singular_values,
        reflection_corrected,
        rmse: (sq_error / points_src.len() as f64).sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn transform_all(points: &[[f64; 3]], r: &DMat3, t: DVec3) -> Vec<[f64; 3]> {
        points
            .iter()
            .map(|p| (*r * DVec3::from_array(*p) + t).to_array())
            .collect()
    }

    fn random_points(n: usize) -> Vec<[f64; 3]> {
        (0..n)
            .map(|_| {
                [
                    rand::random::<f64>() * 100.0 - 50.0,
                    rand::random::<f64>() * 100.0 - 50.0,
                    rand::random::<f64>() * 100.0 + 300.0,
                ]
            })
            .collect()
    }

    #[test]
    fn test_compute_centroids() {
        let points1 = vec![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let points2 = vec![[7.0, 8.0, 9.0], [10.0, 11.0, 12.0]];
        let (c1, c2) = compute_centroids(&points1, &points2);
        assert_relative_eq!(c1.x, 2.5);
        assert_relative_eq!(c1.y, 3.5);
        assert_relative_eq!(c1.z, 4.5);
        assert_relative_eq!(c2.x, 8.5);
        assert_relative_eq!(c2.y, 9.5);
        assert_relative_eq!(c2.z, 10.5);
    }

    #[test]
    fn test_identity_transformation() -> Result<(), RigidError> {
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        let fit = kabsch(&points, &points)?;
        assert!(fit.rotation.abs_diff_eq(DMat3::IDENTITY, 1e-12));
        assert!(fit.translation.abs_diff_eq(DVec3::ZERO, 1e-12));
        assert_relative_eq!(fit.rmse, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_pure_rotation_about_x() -> Result<(), RigidError> {
        let points_src = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ];
        // y -> -z, z -> y
        let points_dst = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 0.0, -1.0],
            [0.0, 1.0, 0.0],
        ];
        let fit = kabsch(&points_src, &points_dst)?;
        let expected = DMat3::from_cols(
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, 0.0, -1.0),
            DVec3::new(0.0, 1.0, 0.0),
        );
        assert!(fit.rotation.abs_diff_eq(expected, 1e-9), "{}", fit.rotation);
        assert!(fit.translation.abs_diff_eq(DVec3::ZERO, 1e-9));
        Ok(())
    }

    #[test]
    fn test_recovers_random_rigid_motion() -> Result<(), RigidError> {
        for _ in 0..50 {
            let points_src = random_points(20);
            let axis = DVec3::new(
                rand::random::<f64>() - 0.5,
                rand::random::<f64>() - 0.5,
                rand::random::<f64>() - 0.5,
            )
            .normalize();
            let angle = rand::random::<f64>() * std::f64::consts::PI;
            let r_true = DMat3::from_axis_angle(axis, angle);
            let t_true = DVec3::new(12.0, -40.0, 7.5);
            let points_dst = transform_all(&points_src, &r_true, t_true);

            let fit = kabsch(&points_src, &points_dst)?;
            assert!(fit.rotation.abs_diff_eq(r_true, 1e-8), "{}", fit.rotation);
            assert!(fit.translation.abs_diff_eq(t_true, 1e-6));
            assert_relative_eq!(fit.rotation.determinant(), 1.0, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_three_points_half_turn() -> Result<(), RigidError> {
        // a half turn is the configuration where V·Uᵀ flips most easily for planar input
        let points_src = vec![[10.0, 0.0, 400.0], [0.0, 20.0, 410.0], [-5.0, -5.0, 395.0]];
        let r_true = DMat3::from_rotation_y(std::f64::consts::PI);
        let t_true = DVec3::new(0.0, 0.0, 800.0);
        let points_dst = transform_all(&points_src, &r_true, t_true);

        let fit = kabsch(&points_src, &points_dst)?;
        assert!(fit.rotation.abs_diff_eq(r_true, 1e-8), "{}", fit.rotation);
        assert!(fit.translation.abs_diff_eq(t_true, 1e-6));
        assert_relative_eq!(fit.rotation.determinant(), 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_reflection_guard_on_adversarial_covariance() {
        // H = U·S·Vᵀ with U = diag(1, 1, -1), V = I: the naive V·Uᵀ is a mirror
        let h = DMat3::from_diagonal(DVec3::new(3.0, 2.0, -1.0));
        let svd = svd3(&h);
        let naive = *svd.v() * svd.u().transpose();
        assert!(naive.determinant() < 0.0);

        let (rotation, singular_values, corrected) = rotation_from_covariance(&h);
        assert!(corrected);
        assert_relative_eq!(rotation.determinant(), 1.0, epsilon = 1e-12);
        assert!((rotation.transpose() * rotation).abs_diff_eq(DMat3::IDENTITY, 1e-12));
        assert!(rotation.abs_diff_eq(DMat3::IDENTITY, 1e-12), "{rotation}");
        assert!(singular_values.abs_diff_eq(DVec3::new(3.0, 2.0, 1.0), 1e-12));
    }

    #[test]
    fn test_mirrored_correspondences_yield_proper_rotation() -> Result<(), RigidError> {
        let points_src = random_points(10);
        // mirror through the x = 0 plane, which no rotation can reproduce
        let points_dst = points_src
            .iter()
            .map(|p| [-p[0], p[1], p[2]])
            .collect::<Vec<_>>();

        let fit = kabsch(&points_src, &points_dst)?;
        assert!(fit.reflection_corrected);
        assert_relative_eq!(fit.rotation.determinant(), 1.0, epsilon = 1e-9);
        assert!(fit.rmse > 0.0);
        Ok(())
    }

    #[test]
    fn test_degenerate_inputs() {
        let collinear = vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [5.0, 5.0, 5.0]];
        assert!(matches!(
            kabsch(&collinear, &collinear),
            Err(RigidError::DegenerateInput(_))
        ));

        let coincident = vec![[3.0, 1.0, 2.0]; 4];
        assert!(matches!(
            kabsch(&coincident, &coincident),
            Err(RigidError::DegenerateInput(_))
        ));

        let two = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];
        assert_eq!(kabsch(&two, &two), Err(RigidError::NotEnoughPoints(2)));

        let three = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert_eq!(
            kabsch(&three, &two),
            Err(RigidError::MismatchedInputLengths(3, 2))
        );
    }
}
