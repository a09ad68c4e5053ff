use faer::prelude::*;
use faer::Mat;

/// Error types for the linear algebra helpers.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LinalgError {
    /// Source and destination buffers differ in length
    #[error("Source and destination must have the same length ({0} != {1})")]
    DimensionMismatch(usize, usize),

    /// The linear system has no unique solution
    #[error("The linear system is singular")]
    SingularSystem,
}

/// Transform a set of points using a rotation and translation.
///
/// # Arguments
///
/// * `src_points` - A set of points to be transformed.
/// * `dst_r_src` - A row-major rotation matrix.
/// * `dst_t_src` - A translation vector.
/// * `dst_points` - A pre-allocated buffer receiving the transformed points.
///
/// Example:
///
/// ```
/// use facescan_3d::linalg::transform_points;
///
/// let src_points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
/// let rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
/// let translation = [0.0, 0.0, 100.0];
/// let mut dst_points = vec![[0.0; 3]; src_points.len()];
/// transform_points(&src_points, &rotation, &translation, &mut dst_points).unwrap();
/// assert_eq!(dst_points[1], [3.0, 4.0, 105.0]);
/// ```
pub fn transform_points(
    src_points: &[[f64; 3]],
    dst_r_src: &[[f64; 3]; 3],
    dst_t_src: &[f64; 3],
    dst_points: &mut [[f64; 3]],
) -> Result<(), LinalgError> {
    if src_points.len() != dst_points.len() {
        return Err(LinalgError::DimensionMismatch(
            src_points.len(),
            dst_points.len(),
        ));
    }
    if src_points.is_empty() {
        return Ok(());
    }

    let dst_r_src_mat = Mat::<f64>::from_fn(3, 3, |i, j| dst_r_src[i][j]);

    // 3xN matrix where each column represents a 3D point
    let points_in_src = Mat::<f64>::from_fn(3, src_points.len(), |i, j| src_points[j][i]);
    let mut points_in_dst = Mat::<f64>::zeros(3, src_points.len());

    faer::linalg::matmul::matmul(
        points_in_dst.as_mut(),
        dst_r_src_mat.as_ref(),
        points_in_src.as_ref(),
        None,
        1.0,
        faer::Parallelism::None,
    );

    for (j, point_dst) in dst_points.iter_mut().enumerate() {
        for (i, value) in point_dst.iter_mut().enumerate() {
            *value = points_in_dst.read(i, j) + dst_t_src[i];
        }
    }

    Ok(())
}

/// Solve the square system `A · x = b` with an LU decomposition with partial pivoting.
///
/// PRECONDITION: `a` is square and `b.len() == a.nrows()`.
pub fn solve_linear_system(a: &Mat<f64>, b: &[f64]) -> Result<Vec<f64>, LinalgError> {
    if a.nrows() != b.len() || a.ncols() != b.len() {
        return Err(LinalgError::DimensionMismatch(a.nrows(), b.len()));
    }
    let rhs = Mat::<f64>::from_fn(b.len(), 1, |i, _| b[i]);
    let solution = a.partial_piv_lu().solve(&rhs);

    let x = (0..b.len()).map(|i| solution.read(i, 0)).collect::<Vec<_>>();
    if x.iter().any(|v| !v.is_finite()) {
        return Err(LinalgError::SingularSystem);
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_points_identity() -> Result<(), LinalgError> {
        let src_points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
        let rotation = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let translation = [0.0, 0.0, 0.0];
        let mut dst_points = vec![[0.0; 3]; src_points.len()];
        transform_points(&src_points, &rotation, &translation, &mut dst_points)?;

        assert_eq!(dst_points, src_points);
        Ok(())
    }

    #[test]
    fn test_transform_points_roundtrip() -> Result<(), LinalgError> {
        let src_points = vec![[2.0, 2.0, 2.0], [3.0, 4.0, 5.0]];
        let rotation = [[1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]];
        let translation = [1.0, 2.0, 3.0];

        let mut dst_points = vec![[0.0; 3]; src_points.len()];
        transform_points(&src_points, &rotation, &translation, &mut dst_points)?;
        assert_eq!(dst_points[1], [4.0, -3.0, 7.0]);

        // R' = R^T, t' = -R^T * t
        let rotation_inv = [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, -1.0, 0.0]];
        let translation_inv = [-1.0, -3.0, 2.0];

        let mut dst_points_src = vec![[0.0; 3]; dst_points.len()];
        transform_points(
            &dst_points,
            &rotation_inv,
            &translation_inv,
            &mut dst_points_src,
        )?;

        assert_eq!(dst_points_src, src_points);
        Ok(())
    }

    #[test]
    fn test_transform_points_mismatch() {
        let mut dst = vec![[0.0; 3]; 1];
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        assert_eq!(
            transform_points(&[[0.0; 3]; 2], &identity, &[0.0; 3], &mut dst),
            Err(LinalgError::DimensionMismatch(2, 1))
        );
    }

    #[test]
    fn test_solve_linear_system() -> Result<(), LinalgError> {
        let a = Mat::<f64>::from_fn(3, 3, |i, j| [[4.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 2.0]][i][j]);
        let x = solve_linear_system(&a, &[5.0, 5.0, 3.0])?;
        for (value, expected) in x.iter().zip([1.0, 1.0, 1.0]) {
            assert!((value - expected).abs() < 1e-12);
        }

        let singular = Mat::<f64>::zeros(2, 2);
        assert_eq!(
            solve_linear_system(&singular, &[1.0, 1.0]),
            Err(LinalgError::SingularSystem)
        );
        Ok(())
    }
}
