#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Cooperative cancellation of a running registration.
pub mod cancel;

/// Views of a scanning session and the accumulator that owns them.
pub mod capture;

/// Configuration of a scanning session.
pub mod config;

/// Error types.
pub mod error;

/// The merged output of a registration.
pub mod merged;

/// Pose graph of absolute view poses and its optimizer.
pub mod pose_graph;

/// Multi-view registration of a capture session.
pub mod registrar;

pub use cancel::CancellationToken;
pub use capture::{
    CaptureAccumulator, CaptureSession, FrameCaptureError, HeadPose, Landmark, LandmarkId,
    PoseMetadata, ViewCapture,
};
pub use config::{PoseGraphConfig, RegistrarConfig, RegistrationMethod, ScanConfig};
pub use error::{CaptureError, ConfigError, PartialRegistrationWarning, RegistrationError};
pub use merged::MergedPointCloud;
pub use registrar::{
    EdgeFailure, EdgeKind, EdgeStatus, EdgeSummary, MultiViewRegistrar, RegistrationOutcome,
};

#[doc(inline)]
pub use facescan_3d as k3d;

#[doc(inline)]
pub use facescan_icp as icp;

#[doc(inline)]
pub use facescan_linalg as linalg;
