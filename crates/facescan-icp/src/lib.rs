#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod ops;
pub use ops::{evaluate_registration, find_correspondences, information_matrix, Correspondence};

mod point_to_plane;
pub use point_to_plane::{IcpConfig, PointToPlaneIcp};

mod registration;
pub use registration::{PairRegistration, PairRegistrationResult, RegistrationError};
