//! Rigid body transforms.
//!
//! A [`RigidTransform`] maps points from a source frame into a destination frame as
//! `p_dst = R · p_src + t`. Tangent vectors of SE(3) are ordered `[ω; v]`, rotation
//! first, and perturbations are applied on the left: `T ← exp(ξ) · T`.

use std::ops::Mul;

use glam::{DMat3, DQuat, DVec3};

use facescan_linalg::rigid::RigidFit;

/// Error types for the transforms module.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransformError {
    /// The rotation axis has zero length
    #[error("Cannot compute a rotation from a zero axis")]
    ZeroAxis,
}

const SMALL_ANGLE: f64 = 1e-10;

/// A rotation followed by a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    /// Proper rotation matrix.
    pub rotation: DMat3,
    /// Translation vector in millimeters.
    pub translation: DVec3,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<RigidFit> for RigidTransform {
    fn from(fit: RigidFit) -> Self {
        Self::new(fit.rotation, fit.translation)
    }
}

impl RigidTransform {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        rotation: DMat3::IDENTITY,
        translation: DVec3::ZERO,
    };

    /// Create a transform from a rotation and a translation.
    pub fn new(rotation: DMat3, translation: DVec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// A pure rotation about `axis` by `angle` radians.
    pub fn from_axis_angle(axis: &[f64; 3], angle: f64) -> Result<Self, TransformError> {
        Ok(Self::new(
            axis_angle_to_rotation_matrix(axis, angle)?,
            DVec3::ZERO,
        ))
    }

    /// Apply the transform to a point.
    #[inline]
    pub fn apply(&self, point: &[f64; 3]) -> [f64; 3] {
        (self.rotation * DVec3::from_array(*point) + self.translation).to_array()
    }

    /// Rotate a direction, ignoring the translation.
    #[inline]
    pub fn apply_vector(&self, vector: &[f64; 3]) -> [f64; 3] {
        (self.rotation * DVec3::from_array(*vector)).to_array()
    }

    /// The composition `self ∘ other`: first `other`, then `self`.
    #[inline]
    pub fn compose(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// The inverse transform.
    #[inline]
    pub fn inverse(&self) -> RigidTransform {
        let rotation = self.rotation.transpose();
        RigidTransform {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// The rotation as row-major nested arrays.
    pub fn rotation_rows(&self) -> [[f64; 3]; 3] {
        let r = self.rotation.transpose();
        [
            r.x_axis.to_array(),
            r.y_axis.to_array(),
            r.z_axis.to_array(),
        ]
    }

    /// The exponential map from the tangent `[ω; v]` to SE(3).
    pub fn exp(xi: &[f64; 6]) -> RigidTransform {
        let omega = DVec3::new(xi[0], xi[1], xi[2]);
        let v = DVec3::new(xi[3], xi[4], xi[5]);
        RigidTransform {
            rotation: so3_exp(omega),
            translation: left_jacobian(omega) * v,
        }
    }

    /// The logarithm map from SE(3) to the tangent `[ω; v]`.
    pub fn log(&self) -> [f64; 6] {
        let omega = so3_log(&self.rotation);
        let v = left_jacobian_inverse(omega) * self.translation;
        [omega.x, omega.y, omega.z, v.x, v.y, v.z]
    }

    /// The rotation angle in radians, in `[0, π]`.
    pub fn rotation_angle(&self) -> f64 {
        so3_log(&self.rotation).length()
    }

    /// Whether the rotation is orthonormal with `det = +1` within `tolerance`.
    pub fn is_proper(&self, tolerance: f64) -> bool {
        (self.rotation.transpose() * self.rotation).abs_diff_eq(DMat3::IDENTITY, tolerance)
            && (self.rotation.determinant() - 1.0).abs() <= tolerance
    }

    /// Project the rotation back onto SO(3) after accumulated floating point drift.
    pub fn orthonormalized(&self) -> RigidTransform {
        RigidTransform {
            rotation: DMat3::from_quat(DQuat::from_mat3(&self.rotation).normalize()),
            translation: self.translation,
        }
    }
}

impl Mul for RigidTransform {
    type Output = RigidTransform;

    fn mul(self, rhs: RigidTransform) -> RigidTransform {
        self.compose(&rhs)
    }
}

/// The skew-symmetric matrix `[v]×` such that `[v]× · u = v × u`.
pub fn hat(v: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, v.z, -v.y),
        DVec3::new(-v.z, 0.0, v.x),
        DVec3::new(v.y, -v.x, 0.0),
    )
}

/// The rotation matrix `exp([ω]×)`.
pub fn so3_exp(omega: DVec3) -> DMat3 {
    let theta = omega.length();
    if theta < SMALL_ANGLE {
        return DMat3::IDENTITY + hat(omega);
    }
    DMat3::from_axis_angle(omega / theta, theta)
}

/// The rotation vector `ω` with `exp([ω]×) = R` and `|ω| ≤ π`.
pub fn so3_log(rotation: &DMat3) -> DVec3 {
    let mut q = DQuat::from_mat3(rotation).normalize();
    if q.w < 0.0 {
        q = -q;
    }
    let xyz = DVec3::new(q.x, q.y, q.z);
    let sin_half = xyz.length();
    if sin_half < SMALL_ANGLE {
        return 2.0 * xyz / q.w;
    }
    let angle = 2.0 * sin_half.atan2(q.w);
    xyz * (angle / sin_half)
}

// V = I + (1 − cos θ)/θ² [ω]× + (θ − sin θ)/θ³ [ω]×²
fn left_jacobian(omega: DVec3) -> DMat3 {
    let theta = omega.length();
    let w = hat(omega);
    let w2 = w * w;
    if theta < 1e-5 {
        return DMat3::IDENTITY + w * 0.5 + w2 * (1.0 / 6.0);
    }
    let theta2 = theta * theta;
    DMat3::IDENTITY
        + w * ((1.0 - theta.cos()) / theta2)
        + w2 * ((theta - theta.sin()) / (theta2 * theta))
}

// V⁻¹ = I − ½[ω]× + (1/θ²)(1 − θ sin θ / (2(1 − cos θ))) [ω]×²
fn left_jacobian_inverse(omega: DVec3) -> DMat3 {
    let theta = omega.length();
    let w = hat(omega);
    let w2 = w * w;
    if theta < 1e-5 {
        return DMat3::IDENTITY - w * 0.5 + w2 * (1.0 / 12.0);
    }
    let theta2 = theta * theta;
    let coeff = (1.0 - theta * theta.sin() / (2.0 * (1.0 - theta.cos()))) / theta2;
    DMat3::IDENTITY - w * 0.5 + w2 * coeff
}

/// Compute the rotation matrix from an axis and angle.
///
/// # Arguments
///
/// * `axis` - The axis of rotation, normalized internally.
/// * `angle` - The angle of rotation in radians.
///
/// Example:
///
/// ```
/// use facescan_3d::transforms::axis_angle_to_rotation_matrix;
///
/// let rotation = axis_angle_to_rotation_matrix(&[0.0, 1.0, 0.0], 20f64.to_radians()).unwrap();
/// assert!((rotation.determinant() - 1.0).abs() < 1e-12);
/// ```
pub fn axis_angle_to_rotation_matrix(axis: &[f64; 3], angle: f64) -> Result<DMat3, TransformError> {
    let axis = DVec3::from_array(*axis);
    let magnitude = axis.length();
    if magnitude < 1e-10 {
        return Err(TransformError::ZeroAxis);
    }
    Ok(DMat3::from_axis_angle(axis / magnitude, angle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_transform_eq(a: &RigidTransform, b: &RigidTransform, epsilon: f64) {
        assert!(
            a.rotation.abs_diff_eq(b.rotation, epsilon),
            "{} != {}",
            a.rotation,
            b.rotation
        );
        assert!(
            a.translation.abs_diff_eq(b.translation, epsilon),
            "{} != {}",
            a.translation,
            b.translation
        );
    }

    #[test]
    fn test_axis_angle_to_rotation_matrix() -> Result<(), TransformError> {
        let rotation = axis_angle_to_rotation_matrix(&[1.0, 0.0, 0.0], std::f64::consts::FRAC_PI_2)?;
        let expected = DMat3::from_cols(
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
            DVec3::new(0.0, -1.0, 0.0),
        );
        assert!(rotation.abs_diff_eq(expected, 1e-12));
        assert_eq!(
            axis_angle_to_rotation_matrix(&[0.0; 3], 1.0),
            Err(TransformError::ZeroAxis)
        );
        Ok(())
    }

    #[test]
    fn test_compose_inverse() {
        let a = RigidTransform::new(
            DMat3::from_rotation_y(0.3) * DMat3::from_rotation_x(-0.2),
            DVec3::new(10.0, -4.0, 2.0),
        );
        assert_transform_eq(&(a * a.inverse()), &RigidTransform::IDENTITY, 1e-12);
        assert_transform_eq(&(a.inverse() * a), &RigidTransform::IDENTITY, 1e-12);

        let b = RigidTransform::new(DMat3::from_rotation_z(1.0), DVec3::new(0.0, 3.0, 0.0));
        let p = [1.0, 2.0, 3.0];
        let composed = a.compose(&b).apply(&p);
        let sequential = a.apply(&b.apply(&p));
        for i in 0..3 {
            assert_relative_eq!(composed[i], sequential[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let tangents = [
            [0.0, 0.0, 0.0, 1.0, 2.0, 3.0],
            [1e-8, -2e-8, 0.0, 5.0, 0.0, -1.0],
            [0.1, 0.2, -0.3, 10.0, -20.0, 30.0],
            [0.0, std::f64::consts::PI - 1e-3, 0.0, 0.0, 0.0, 100.0],
        ];
        for xi in tangents {
            let log = RigidTransform::exp(&xi).log();
            for i in 0..6 {
                assert_relative_eq!(log[i], xi[i], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_exp_pure_translation() {
        let t = RigidTransform::exp(&[0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
        assert_transform_eq(
            &t,
            &RigidTransform::new(DMat3::IDENTITY, DVec3::new(1.0, 2.0, 3.0)),
            1e-15,
        );
    }

    #[test]
    fn test_so3_log_half_turn() {
        let rotation = DMat3::from_rotation_y(std::f64::consts::PI);
        let omega = so3_log(&rotation);
        assert_relative_eq!(omega.length(), std::f64::consts::PI, epsilon = 1e-9);
        assert!(so3_exp(omega).abs_diff_eq(rotation, 1e-9));
    }

    #[test]
    fn test_hat() {
        let v = DVec3::new(1.0, 2.0, 3.0);
        let u = DVec3::new(-4.0, 0.5, 2.0);
        assert!((hat(v) * u).abs_diff_eq(v.cross(u), 1e-12));
    }

    #[test]
    fn test_is_proper() {
        let t = RigidTransform::new(DMat3::from_rotation_x(0.4), DVec3::ONE);
        assert!(t.is_proper(1e-12));
        let mirror = RigidTransform::new(DMat3::from_diagonal(DVec3::new(-1.0, 1.0, 1.0)), DVec3::ZERO);
        assert!(!mirror.is_proper(1e-6));
        assert_relative_eq!(t.rotation_angle(), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_rows() {
        let t = RigidTransform::new(DMat3::from_rotation_z(std::f64::consts::FRAC_PI_2), DVec3::ZERO);
        let rows = t.rotation_rows();
        // first row of Rz(90°) is [0, -1, 0]
        assert!((rows[0][1] + 1.0).abs() < 1e-12);
        assert!((rows[1][0] - 1.0).abs() < 1e-12);
    }
}
