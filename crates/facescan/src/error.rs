use facescan_3d::linalg::LinalgError;

/// Error types for the capture accumulator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The session was frozen for registration and accepts no more captures
    #[error("The capture session is frozen")]
    Frozen,
}

/// Error types for the pose graph.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoseGraphError {
    /// An edge refers to a node that does not exist
    #[error("Edge {source_node} -> {target_node} refers to a missing node (graph has {num_nodes})")]
    InvalidNode {
        /// Source node of the edge.
        source_node: usize,
        /// Target node of the edge.
        target_node: usize,
        /// Number of nodes in the graph.
        num_nodes: usize,
    },

    /// An edge connects a node to itself
    #[error("Edge connects node {0} to itself")]
    SelfLoop(usize),

    /// The reference node does not exist
    #[error("Reference node {0} is out of range")]
    InvalidReference(usize),

    /// The normal equations could not be solved
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Error types for multi-view registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// The pose graph could not be resolved
    #[error(transparent)]
    PoseGraph(#[from] PoseGraphError),

    /// A view could not be transformed into the reference frame
    #[error(transparent)]
    Linalg(#[from] LinalgError),
}

/// Error types for loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for the expected schema
    #[error("Failed to parse configuration")]
    Json(#[from] serde_json::Error),

    /// A value is outside its valid range
    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

/// Views left out of a merge because they could not be related to the reference view.
///
/// This is a non-fatal outcome: the merge holds every other view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Views {excluded_views:?} could not be registered to the reference view and were excluded")]
pub struct PartialRegistrationWarning {
    /// Capture indices of the excluded views, ascending.
    pub excluded_views: Vec<usize>,
}
