use std::path::Path;

use serde::{Deserialize, Serialize};

use facescan_3d::unproject::DepthRange;
use facescan_icp::IcpConfig;

use crate::error::ConfigError;

/// How pairwise edges between views are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMethod {
    /// Closed-form fit of the landmarks both views share.
    Landmarks,
    /// Point-to-plane ICP seeded from the head pose metadata.
    Icp,
    /// Landmark fit refined by point-to-plane ICP.
    #[default]
    LandmarksThenIcp,
}

/// Parameters of the pose graph optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphConfig {
    /// Maximum number of Levenberg-Marquardt iterations.
    pub max_iterations: usize,
    /// Stop when the relative cost decrease or the step norm falls below this value.
    pub convergence_threshold: f64,
    /// Initial damping factor.
    pub initial_lambda: f64,
    /// Loop closure preference times the squared correspondence distance, in mm².
    ///
    /// Scaled by the mean correspondence count of the odometry edges it becomes the `μ` of
    /// the line process weight `(μ / (μ + χ²))²`.
    pub loop_closure_scale: f64,
    /// Loop closures whose line process weight ends below this value are pruned.
    pub edge_prune_threshold: f64,
}

impl Default for PoseGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-9,
            initial_lambda: 1e-4,
            loop_closure_scale: 9.0,
            edge_prune_threshold: 0.25,
        }
    }
}

/// Parameters of the multi-view registrar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// How pairwise edges are estimated.
    pub method: RegistrationMethod,
    /// Edges with a lower confidence are dropped, in `[0, 1]`.
    pub min_confidence: f64,
    /// A landmark counts as an inlier of a landmark fit when its residual is below this
    /// distance, in millimeters.
    pub landmark_inlier_distance: f64,
    /// Non-adjacent views whose yaw differs by at most this angle get a loop closure edge,
    /// in degrees.
    pub max_loop_closure_yaw: f64,
    /// Distance behind the face centroid of the pivot the head turns about, in millimeters.
    ///
    /// Seeds ICP from the yaw difference of two views when no landmark fit is available.
    pub head_pivot_depth: f64,
    /// Point-to-plane ICP parameters.
    pub icp: IcpConfig,
    /// Pose graph optimizer parameters.
    pub pose_graph: PoseGraphConfig,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            method: RegistrationMethod::default(),
            min_confidence: 0.3,
            landmark_inlier_distance: 5.0,
            max_loop_closure_yaw: 45.0,
            head_pivot_depth: 80.0,
            icp: IcpConfig::default(),
            pose_graph: PoseGraphConfig::default(),
        }
    }
}

/// Top level configuration of a scanning session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Depth samples outside this range are not unprojected.
    pub depth_range: DepthRange,
    /// Multi-view registration parameters.
    pub registrar: RegistrarConfig,
}

impl ScanConfig {
    /// Parse and validate a configuration from a JSON string.
    ///
    /// Missing fields take their default value.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ScanConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check that every value is inside its valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = &self.depth_range;
        if !(range.min_depth.is_finite() && range.max_depth.is_finite())
            || range.min_depth > range.max_depth
        {
            return Err(ConfigError::InvalidValue(format!(
                "depth range [{}, {}]",
                range.min_depth, range.max_depth
            )));
        }

        let registrar = &self.registrar;
        if !(0.0..=1.0).contains(&registrar.min_confidence) {
            return Err(ConfigError::InvalidValue(format!(
                "min_confidence {} not in [0, 1]",
                registrar.min_confidence
            )));
        }
        if registrar.landmark_inlier_distance.is_nan() || registrar.landmark_inlier_distance <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "landmark_inlier_distance {}",
                registrar.landmark_inlier_distance
            )));
        }

        let icp = &registrar.icp;
        if icp.fine_distance.is_nan()
            || icp.fine_distance <= 0.0
            || icp.coarse_distance < icp.fine_distance
        {
            return Err(ConfigError::InvalidValue(format!(
                "icp distances coarse {} fine {}",
                icp.coarse_distance, icp.fine_distance
            )));
        }

        let pose_graph = &registrar.pose_graph;
        if pose_graph.loop_closure_scale.is_nan() || pose_graph.loop_closure_scale <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "loop_closure_scale {}",
                pose_graph.loop_closure_scale
            )));
        }
        if pose_graph.initial_lambda.is_nan() || pose_graph.initial_lambda <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "initial_lambda {}",
                pose_graph.initial_lambda
            )));
        }

        Ok(())
    }
}
