//! 3×3 Singular Value Decomposition (SVD) in double precision.
//!
//! The decomposition follows the structure of the minimal-branching algorithm of
//! McAdams et al.: a cyclic Jacobi eigenanalysis of `AᵀA` yields the right singular
//! vectors, the columns of `A·V` are sorted by magnitude and a Givens QR decomposition
//! of the sorted matrix yields the left singular vectors and the singular values.
//!
//! Rigid alignment needs accurate singular vectors more than it needs speed, so the
//! Jacobi rotations use the exact angle and iterate until the off-diagonal mass
//! vanishes instead of running a fixed number of approximate sweeps.
//!
//! ```text
//! A = U Σ Vᵀ,   σ₁ ≥ σ₂ ≥ σ₃ ≥ 0
//! ```
//!
//! # Example
//!
//! ```
//! use glam::{DMat3, DVec3};
//! use facescan_linalg::svd::svd3;
//!
//! let matrix = DMat3::from_diagonal(DVec3::new(1.0, 2.0, 3.0));
//! let svd_result = svd3(&matrix);
//! assert!((svd_result.singular_values().x - 3.0).abs() < 1e-12);
//! ```
//!
//! # References
//!
//! * McAdams, Selle, Tamstorf, Teran, and Sifakis (2011).
//!   "Computing the Singular Value Decomposition of 3x3 matrices with minimal
//!   branching and elementary floating point operations."
//!   University of Wisconsin-Madison Technical Report TR1690.

use glam::{DMat3, DQuat, DVec3};

const SVD3_EPSILON: f64 = 1e-15;
const MAX_SWEEPS: usize = 32;

#[derive(Debug, Clone)]
/// A symmetric 3x3 matrix, storing only the lower triangle.
struct Symmetric3x3 {
    m_00: f64,
    m_10: f64,
    m_11: f64,
    m_20: f64,
    m_21: f64,
    m_22: f64,
}

impl Symmetric3x3 {
    fn from_dmat3(mat: &DMat3) -> Self {
        Symmetric3x3 {
            m_00: mat.x_axis.x,
            m_10: mat.y_axis.x,
            m_11: mat.y_axis.y,
            m_20: mat.x_axis.z,
            m_21: mat.y_axis.z,
            m_22: mat.z_axis.z,
        }
    }

    fn off_diagonal_norm_sq(&self) -> f64 {
        self.m_10 * self.m_10 + self.m_20 * self.m_20 + self.m_21 * self.m_21
    }

    fn diagonal_norm_sq(&self) -> f64 {
        self.m_00 * self.m_00 + self.m_11 * self.m_11 + self.m_22 * self.m_22
    }
}

#[derive(Debug)]
/// Cosine and sine of a half rotation angle.
struct Givens {
    cos_theta: f64,
    sin_theta: f64,
}

#[derive(Debug)]
struct QR3 {
    q: DMat3,
    r: DMat3,
}

/// The output of [`svd3`].
#[derive(Debug, Clone)]
pub struct SVD3Set {
    u: DMat3,
    s: DMat3,
    v: DMat3,
}

impl SVD3Set {
    /// Get the left singular vectors matrix.
    #[inline]
    pub fn u(&self) -> &DMat3 {
        &self.u
    }

    /// Get the diagonal matrix of singular values.
    #[inline]
    pub fn s(&self) -> &DMat3 {
        &self.s
    }

    /// Get the right singular vectors matrix.
    #[inline]
    pub fn v(&self) -> &DMat3 {
        &self.v
    }

    /// Singular values in descending order.
    #[inline]
    pub fn singular_values(&self) -> DVec3 {
        DVec3::new(self.s.x_axis.x, self.s.y_axis.y, self.s.z_axis.z)
    }
}

/// Half-angle of the Jacobi rotation that annihilates `s_pq`.
#[inline(always)]
fn jacobi_givens_parameters(s_pp: f64, s_qq: f64, s_pq: f64) -> Givens {
    let theta = 0.5 * (2.0 * s_pq).atan2(s_pp - s_qq);
    let half = 0.5 * theta;
    Givens {
        cos_theta: half.cos(),
        sin_theta: half.sin(),
    }
}

#[inline(always)]
fn conjugate_xy(s: &mut Symmetric3x3, q: &mut DQuat) {
    let g = jacobi_givens_parameters(s.m_00, s.m_11, s.m_10);
    let a = g.cos_theta * g.cos_theta - g.sin_theta * g.sin_theta;
    let b = 2.0 * g.sin_theta * g.cos_theta;

    let s00 = s.m_00;
    let s10 = s.m_10;
    let s11 = s.m_11;
    let s20 = s.m_20;
    let s21 = s.m_21;

    s.m_00 = a * (a * s00 + b * s10) + b * (a * s10 + b * s11);
    s.m_10 = a * (-b * s00 + a * s10) + b * (-b * s10 + a * s11);
    s.m_11 = -b * (-b * s00 + a * s10) + a * (-b * s10 + a * s11);
    s.m_20 = a * s20 + b * s21;
    s.m_21 = -b * s20 + a * s21;

    // q <- q * (0, 0, sin, cos)
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    q.x = x * g.cos_theta + y * g.sin_theta;
    q.y = y * g.cos_theta - x * g.sin_theta;
    q.z = z * g.cos_theta + w * g.sin_theta;
    q.w = w * g.cos_theta - z * g.sin_theta;
}

#[inline(always)]
fn conjugate_yz(s: &mut Symmetric3x3, q: &mut DQuat) {
    let g = jacobi_givens_parameters(s.m_11, s.m_22, s.m_21);
    let a = g.cos_theta * g.cos_theta - g.sin_theta * g.sin_theta;
    let b = 2.0 * g.sin_theta * g.cos_theta;

    let s11 = s.m_11;
    let s21 = s.m_21;
    let s22 = s.m_22;
    let s10 = s.m_10;
    let s20 = s.m_20;

    s.m_11 = a * (a * s11 + b * s21) + b * (a * s21 + b * s22);
    s.m_21 = a * (-b * s11 + a * s21) + b * (-b * s21 + a * s22);
    s.m_22 = -b * (-b * s11 + a * s21) + a * (-b * s21 + a * s22);
    s.m_10 = a * s10 + b * s20;
    s.m_20 = -b * s10 + a * s20;

    // q <- q * (sin, 0, 0, cos)
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    q.x = x * g.cos_theta + w * g.sin_theta;
    q.y = y * g.cos_theta + z * g.sin_theta;
    q.z = z * g.cos_theta - y * g.sin_theta;
    q.w = w * g.cos_theta - x * g.sin_theta;
}

#[inline(always)]
fn conjugate_xz(s: &mut Symmetric3x3, q: &mut DQuat) {
    let g = jacobi_givens_parameters(s.m_00, s.m_22, s.m_20);
    let a = g.cos_theta * g.cos_theta - g.sin_theta * g.sin_theta;
    let b = 2.0 * g.sin_theta * g.cos_theta;

    let s00 = s.m_00;
    let s20 = s.m_20;
    let s22 = s.m_22;
    let s10 = s.m_10;
    let s21 = s.m_21;

    s.m_00 = a * (a * s00 + b * s20) + b * (a * s20 + b * s22);
    s.m_20 = a * (-b * s00 + a * s20) + b * (-b * s20 + a * s22);
    s.m_22 = -b * (-b * s00 + a * s20) + a * (-b * s20 + a * s22);
    s.m_10 = a * s10 + b * s21;
    s.m_21 = -b * s10 + a * s21;

    // the (x, z) plane rotation turns x towards +z, which is a negative turn about y:
    // q <- q * (0, -sin, 0, cos)
    let (x, y, z, w) = (q.x, q.y, q.z, q.w);
    q.x = x * g.cos_theta + z * g.sin_theta;
    q.y = y * g.cos_theta - w * g.sin_theta;
    q.z = z * g.cos_theta - x * g.sin_theta;
    q.w = w * g.cos_theta + y * g.sin_theta;
}

/// Returns the rotation diagonalizing `s` together with the diagonalized matrix.
fn jacobi_eigenanalysis(mut s: Symmetric3x3) -> (DMat3, Symmetric3x3) {
    let mut q = DQuat::IDENTITY;
    for _ in 0..MAX_SWEEPS {
        conjugate_xy(&mut s, &mut q);
        conjugate_yz(&mut s, &mut q);
        conjugate_xz(&mut s, &mut q);

        let off_diag_norm_sq = s.off_diagonal_norm_sq();
        if off_diag_norm_sq <= 1e-30 * s.diagonal_norm_sq() {
            break;
        }
    }
    (DMat3::from_quat(q.normalize()), s)
}

/// Eigen-decomposition of a symmetric 3x3 matrix.
///
/// Returns the eigenvalues in descending order and the matrix whose columns are the
/// matching unit eigenvectors.
pub fn symmetric_eigen3(a: &DMat3) -> (DVec3, DMat3) {
    let (v, s) = jacobi_eigenanalysis(Symmetric3x3::from_dmat3(a));
    let mut pairs = [
        (s.m_00, v.x_axis),
        (s.m_11, v.y_axis),
        (s.m_22, v.z_axis),
    ];
    pairs.sort_by(|lhs, rhs| rhs.0.total_cmp(&lhs.0));
    (
        DVec3::new(pairs[0].0, pairs[1].0, pairs[2].0),
        DMat3::from_cols(pairs[0].1, pairs[1].1, pairs[2].1),
    )
}

/// Swaps `x` and `y` and negates the new `y` when `c` is true, keeping `det` unchanged.
#[inline(always)]
fn cond_neg_swap(c: bool, x: &mut DVec3, y: &mut DVec3) {
    if c {
        let z = -*x;
        *x = *y;
        *y = z;
    }
}

/// Sorts the columns of `b` by decreasing norm and permutes `v` accordingly.
#[inline(always)]
pub fn sort_singular_values(b: &mut DMat3, v: &mut DMat3) {
    let mut rho1 = b.x_axis.length_squared();
    let mut rho2 = b.y_axis.length_squared();
    let mut rho3 = b.z_axis.length_squared();

    let c1 = rho1 < rho2;
    if c1 {
        std::mem::swap(&mut rho1, &mut rho2);
    }
    cond_neg_swap(c1, &mut b.x_axis, &mut b.y_axis);
    cond_neg_swap(c1, &mut v.x_axis, &mut v.y_axis);

    let c2 = rho1 < rho3;
    if c2 {
        std::mem::swap(&mut rho1, &mut rho3);
    }
    cond_neg_swap(c2, &mut b.x_axis, &mut b.z_axis);
    cond_neg_swap(c2, &mut v.x_axis, &mut v.z_axis);

    let c3 = rho2 < rho3;
    cond_neg_swap(c3, &mut b.y_axis, &mut b.z_axis);
    cond_neg_swap(c3, &mut v.y_axis, &mut v.z_axis);
}

/// Givens rotation used by the QR decomposition (Algorithm 4).
#[inline(always)]
fn qr_givens_quaternion(a1: f64, a2: f64) -> Givens {
    let rho = (a1 * a1 + a2 * a2).sqrt();

    let mut g = Givens {
        cos_theta: a1.abs() + f64::max(rho, SVD3_EPSILON),
        sin_theta: if rho > SVD3_EPSILON { a2 } else { 0.0 },
    };

    if a1 < 0.0 {
        std::mem::swap(&mut g.sin_theta, &mut g.cos_theta);
    }

    let w = (g.cos_theta * g.cos_theta + g.sin_theta * g.sin_theta)
        .sqrt()
        .recip();
    g.cos_theta *= w;
    g.sin_theta *= w;
    g
}

/// Applies the rotation `[[a, b], [-b, a]]` to rows `p` and `q` of every column.
#[inline(always)]
fn rotate_rows(m: &mut DMat3, p: usize, q: usize, a: f64, b: f64) {
    for col in [&mut m.x_axis, &mut m.y_axis, &mut m.z_axis] {
        let cp = col[p];
        let cq = col[q];
        col[p] = a * cp + b * cq;
        col[q] = -b * cp + a * cq;
    }
}

/// QR decomposition of a 3x3 matrix using Givens rotations.
fn qr_decomposition(b_mat: &mut DMat3) -> QR3 {
    // zero out b[1][0]
    let g1 = qr_givens_quaternion(b_mat.x_axis.x, b_mat.x_axis.y);
    let a1 = -2.0 * g1.sin_theta * g1.sin_theta + 1.0;
    let b1 = 2.0 * g1.cos_theta * g1.sin_theta;
    rotate_rows(b_mat, 0, 1, a1, b1);

    // zero out b[2][0]
    let g2 = qr_givens_quaternion(b_mat.x_axis.x, b_mat.x_axis.z);
    let a2 = -2.0 * g2.sin_theta * g2.sin_theta + 1.0;
    let b2 = 2.0 * g2.cos_theta * g2.sin_theta;
    rotate_rows(b_mat, 0, 2, a2, b2);

    // zero out b[2][1]
    let g3 = qr_givens_quaternion(b_mat.y_axis.y, b_mat.y_axis.z);
    let a3 = -2.0 * g3.sin_theta * g3.sin_theta + 1.0;
    let b3 = 2.0 * g3.cos_theta * g3.sin_theta;
    rotate_rows(b_mat, 1, 2, a3, b3);

    let r = *b_mat;

    let q1 = DMat3::from_cols(DVec3::new(a1, b1, 0.0), DVec3::new(-b1, a1, 0.0), DVec3::Z);
    let q2 = DMat3::from_cols(DVec3::new(a2, 0.0, b2), DVec3::Y, DVec3::new(-b2, 0.0, a2));
    let q3 = DMat3::from_cols(DVec3::X, DVec3::new(0.0, a3, b3), DVec3::new(0.0, -b3, a3));

    QR3 {
        q: q1 * q2 * q3,
        r,
    }
}

/// Computes the singular value decomposition `a = U Σ Vᵀ` of a 3x3 matrix.
///
/// `U` and `V` are orthogonal (not necessarily proper rotations) and the singular
/// values are non-negative and sorted in descending order.
pub fn svd3(a: &DMat3) -> SVD3Set {
    // right singular vectors are the eigenvectors of AᵀA
    let (mut v, _) = jacobi_eigenanalysis(Symmetric3x3::from_dmat3(&(a.transpose() * *a)));
    let mut b = *a * v;

    sort_singular_values(&mut b, &mut v);

    let qr = qr_decomposition(&mut b);
    let mut u = qr.q;
    let mut s = qr.r;

    if s.x_axis.x < 0.0 {
        u.x_axis = -u.x_axis;
    }
    if s.y_axis.y < 0.0 {
        u.y_axis = -u.y_axis;
    }
    if s.z_axis.z < 0.0 {
        u.z_axis = -u.z_axis;
    }

    s = DMat3::from_diagonal(DVec3::new(
        s.x_axis.x.abs(),
        s.y_axis.y.abs(),
        s.z_axis.z.abs(),
    ));

    SVD3Set { u, s, v }
}
