use std::path::Path;

use glam::DMat3;
use serde::{Deserialize, Serialize};

use crate::frame::ImageSize;
use crate::undistort::{UndistortError, UndistortionMap};

/// Error types for camera calibration documents.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Failed to read the calibration file
    #[error("Failed to read calibration file")]
    Io(#[from] std::io::Error),

    /// Failed to parse the calibration document
    #[error("Failed to parse calibration document")]
    Json(#[from] serde_json::Error),

    /// The camera matrix is not a valid pinhole matrix
    #[error("Invalid camera matrix: {0}")]
    InvalidMatrix(String),

    /// The reference width must be strictly positive
    #[error("Invalid intrinsic reference width {0}")]
    InvalidReferenceWidth(f64),

    /// Failed to build the undistortion map
    #[error(transparent)]
    Undistort(#[from] UndistortError),
}

/// Pinhole camera intrinsics.
///
/// Focal lengths and principal point are in pixels. Depth is always taken in millimeters,
/// there is no unit scale, so unprojected points are in millimeters too.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length along x in pixels.
    pub fx: f64,
    /// Focal length along y in pixels.
    pub fy: f64,
    /// Principal point x coordinate in pixels.
    pub cx: f64,
    /// Principal point y coordinate in pixels.
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Create new intrinsics from focal lengths and principal point.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Unproject the pixel `(px, py)` with depth `depth` to a point in camera space.
    ///
    /// ```
    /// use facescan_3d::camera::CameraIntrinsics;
    ///
    /// let intrinsics = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
    /// let point = intrinsics.unproject(420.0, 240.0, 400.0);
    /// assert_eq!(point, [80.0, 0.0, 400.0]);
    /// ```
    #[inline]
    pub fn unproject(&self, px: f64, py: f64, depth: f64) -> [f64; 3] {
        [
            (px - self.cx) * depth / self.fx,
            (py - self.cy) * depth / self.fy,
            depth,
        ]
    }

    /// Project a camera space point to pixel coordinates.
    ///
    /// Returns `None` for points on or behind the camera plane.
    #[inline]
    pub fn project(&self, point: &[f64; 3]) -> Option<[f64; 2]> {
        let [x, y, z] = *point;
        if z <= 0.0 {
            return None;
        }
        Some([self.fx * x / z + self.cx, self.fy * y / z + self.cy])
    }

    /// Intrinsics for an image scaled by `factor` along both axes.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            fx: self.fx * factor,
            fy: self.fy * factor,
            cx: self.cx * factor,
            cy: self.cy * factor,
        }
    }

    /// The 3x3 camera matrix `K`.
    pub fn camera_matrix(&self) -> DMat3 {
        DMat3::from_cols_array(&[
            self.fx, 0.0, 0.0, //
            0.0, self.fy, 0.0, //
            self.cx, self.cy, 1.0,
        ])
    }
}

/// Calibration document produced by the capture device.
///
/// ```json
/// {
///   "intrinsic": [fx, 0, 0, 0, fy, 0, cx, cy, 1],
///   "intrinsicReferenceDimensionWidth": 4032,
///   "inverseLensDistortionLookup": [0.0, 0.001, ...],
///   "lensDistortionCenter": [2016.5, 1512.3]
/// }
/// ```
///
/// The camera matrix is stored column-major and refers to an image of width
/// `intrinsicReferenceDimensionWidth`. The inverse lookup holds the radial magnification
/// as a function of the normalized distance to the distortion center. Other fields of the
/// document, such as the forward `lensDistortionLookup`, are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calibration {
    /// Column-major camera matrix at the reference resolution.
    pub intrinsic: [f64; 9],
    /// Width in pixels the camera matrix refers to.
    pub intrinsic_reference_dimension_width: f64,
    /// Radial lookup mapping distorted to undistorted radii.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_lens_distortion_lookup: Option<Vec<f64>>,
    /// Distortion center in reference pixels, defaults to the principal point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens_distortion_center: Option<[f64; 2]>,
}

impl Calibration {
    /// Parse and validate a calibration document.
    pub fn from_json_str(json: &str) -> Result<Self, CalibrationError> {
        let calibration: Calibration = serde_json::from_str(json)?;
        calibration.validate()?;
        Ok(calibration)
    }

    /// Read, parse and validate a calibration document from a file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        let k = &self.intrinsic;
        if k.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::InvalidMatrix(
                "non-finite entry".to_string(),
            ));
        }
        if k[0] <= 0.0 || k[4] <= 0.0 {
            return Err(CalibrationError::InvalidMatrix(format!(
                "focal lengths must be positive, got fx={} fy={}",
                k[0], k[4]
            )));
        }
        if (k[8] - 1.0).abs() > 1e-9 || k[2] != 0.0 || k[5] != 0.0 {
            return Err(CalibrationError::InvalidMatrix(
                "last row must be [0, 0, 1]".to_string(),
            ));
        }
        let width = self.intrinsic_reference_dimension_width;
        if !(width.is_finite() && width > 0.0) {
            return Err(CalibrationError::InvalidReferenceWidth(width));
        }
        Ok(())
    }

    /// The intrinsics at the reference resolution.
    pub fn intrinsics(&self) -> CameraIntrinsics {
        let k = &self.intrinsic;
        CameraIntrinsics::new(k[0], k[4], k[6], k[7])
    }

    /// The intrinsics rescaled to an image of the given width.
    pub fn intrinsics_for_width(&self, width: usize) -> Result<CameraIntrinsics, CalibrationError> {
        Ok(self.intrinsics().scaled(self.scale_for_width(width)?))
    }

    /// The undistortion map for an image of the given size, when the document carries an
    /// inverse distortion lookup.
    pub fn undistortion_map(
        &self,
        size: ImageSize,
    ) -> Result<Option<UndistortionMap>, CalibrationError> {
        let Some(lookup) = self.inverse_lens_distortion_lookup.as_deref() else {
            return Ok(None);
        };
        let scale = self.scale_for_width(size.width)?;
        let center = match self.lens_distortion_center {
            Some([x, y]) => [x * scale, y * scale],
            None => {
                let intrinsics = self.intrinsics_for_width(size.width)?;
                [intrinsics.cx, intrinsics.cy]
            }
        };
        Ok(Some(UndistortionMap::from_inverse_lookup(
            lookup, center, size,
        )?))
    }

    fn scale_for_width(&self, width: usize) -> Result<f64, CalibrationError> {
        let reference = self.intrinsic_reference_dimension_width;
        if !(reference.is_finite() && reference > 0.0) {
            return Err(CalibrationError::InvalidReferenceWidth(reference));
        }
        Ok(width as f64 / reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const CALIBRATION: &str = r#"{
        "intrinsic": [2800.0, 0.0, 0.0, 0.0, 2800.0, 0.0, 2016.0, 1512.0, 1.0],
        "intrinsicReferenceDimensionWidth": 4032,
        "inverseLensDistortionLookup": [0.0, 0.0, 0.0, 0.0]
    }"#;

    #[test]
    fn test_unproject_project_inverse() {
        let intrinsics = CameraIntrinsics::new(525.0, 520.0, 319.5, 239.5);
        for (px, py, depth) in [
            (0.0, 0.0, 1.0),
            (319.5, 239.5, 400.0),
            (12.25, 401.75, 999.0),
            (639.0, 479.0, 250.5),
        ] {
            let point = intrinsics.unproject(px, py, depth);
            assert_eq!(point[2], depth);
            let Some([u, v]) = intrinsics.project(&point) else {
                panic!("point must be in front of the camera");
            };
            assert_relative_eq!(u, px, epsilon = 1e-9);
            assert_relative_eq!(v, py, epsilon = 1e-9);
        }
        assert_eq!(intrinsics.project(&[1.0, 1.0, 0.0]), None);
    }

    #[test]
    fn test_camera_matrix() {
        let intrinsics = CameraIntrinsics::new(500.0, 510.0, 320.0, 240.0);
        let k = intrinsics.camera_matrix();
        assert_eq!(k.x_axis.x, 500.0);
        assert_eq!(k.y_axis.y, 510.0);
        assert_eq!(k.z_axis.x, 320.0);
        assert_eq!(k.z_axis.y, 240.0);
        assert_eq!(k.z_axis.z, 1.0);
    }

    #[test]
    fn test_calibration_scaling() -> Result<(), CalibrationError> {
        let calibration = Calibration::from_json_str(CALIBRATION)?;
        assert_eq!(
            calibration.intrinsics(),
            CameraIntrinsics::new(2800.0, 2800.0, 2016.0, 1512.0)
        );

        let intrinsics = calibration.intrinsics_for_width(640)?;
        let scale = 640.0 / 4032.0;
        assert_relative_eq!(intrinsics.fx, 2800.0 * scale);
        assert_relative_eq!(intrinsics.fy, 2800.0 * scale);
        assert_relative_eq!(intrinsics.cx, 2016.0 * scale);
        assert_relative_eq!(intrinsics.cy, 1512.0 * scale);
        Ok(())
    }

    #[test]
    fn test_calibration_undistortion_map() -> Result<(), CalibrationError> {
        let calibration = Calibration::from_json_str(CALIBRATION)?;
        let size = ImageSize {
            width: 8,
            height: 6,
        };
        let map = calibration.undistortion_map(size)?;
        assert!(map.is_some());

        let mut without_lookup = calibration.clone();
        without_lookup.inverse_lens_distortion_lookup = None;
        assert!(without_lookup.undistortion_map(size)?.is_none());
        Ok(())
    }

    #[test]
    fn test_calibration_ignores_forward_lookup() -> Result<(), CalibrationError> {
        let calibration = Calibration::from_json_str(
            r#"{
                "intrinsic": [2800.0, 0.0, 0.0, 0.0, 2800.0, 0.0, 2016.0, 1512.0, 1.0],
                "intrinsicReferenceDimensionWidth": 4032,
                "lensDistortionLookup": [0.0, 0.01, 0.02]
            }"#,
        )?;
        assert!(calibration.inverse_lens_distortion_lookup.is_none());
        let size = ImageSize {
            width: 8,
            height: 6,
        };
        assert!(calibration.undistortion_map(size)?.is_none());
        Ok(())
    }

    #[test]
    fn test_calibration_invalid() {
        let bad_focal = r#"{
            "intrinsic": [0.0, 0.0, 0.0, 0.0, 2800.0, 0.0, 2016.0, 1512.0, 1.0],
            "intrinsicReferenceDimensionWidth": 4032
        }"#;
        assert!(matches!(
            Calibration::from_json_str(bad_focal),
            Err(CalibrationError::InvalidMatrix(_))
        ));

        let bad_width = r#"{
            "intrinsic": [2800.0, 0.0, 0.0, 0.0, 2800.0, 0.0, 2016.0, 1512.0, 1.0],
            "intrinsicReferenceDimensionWidth": 0
        }"#;
        assert!(matches!(
            Calibration::from_json_str(bad_width),
            Err(CalibrationError::InvalidReferenceWidth(_))
        ));

        assert!(matches!(
            Calibration::from_json_str("{"),
            Err(CalibrationError::Json(_))
        ));
        assert!(matches!(
            Calibration::from_json_file("/nonexistent/calibration.json"),
            Err(CalibrationError::Io(_))
        ));
    }
}
