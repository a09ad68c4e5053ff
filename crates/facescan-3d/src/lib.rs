#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Pinhole camera intrinsics and calibration documents.
pub mod camera;

/// Point cloud filters: voxel downsampling and statistical outlier removal.
pub mod filter;

/// Depth and color frames.
pub mod frame;

/// I/O utilities for reading and writing 3D data.
pub mod io;

/// Linear algebra utilities.
pub mod linalg;

/// Nearest neighbour search over point sets.
pub mod neighbors;

/// Surface normal estimation.
pub mod normals;

/// Colored point clouds.
pub mod pointcloud;

/// Rigid body transforms and the SE(3) exponential map.
pub mod transforms;

/// Lens distortion correction for depth and color frames.
pub mod undistort;

/// Depth map to point cloud unprojection.
pub mod unproject;
