mod reader;
mod writer;

pub use reader::*;
pub use writer::*;

/// Error types for the PLY module.
#[derive(Debug, thiserror::Error)]
pub enum PlyError {
    /// Failed to read or write the PLY file
    #[error("Failed to read or write PLY file")]
    Io(#[from] std::io::Error),

    /// The header is malformed
    #[error("Invalid PLY header: {0}")]
    InvalidHeader(String),

    /// Only the ASCII encoding is supported
    #[error("Unsupported PLY format {0}")]
    UnsupportedFormat(String),

    /// A required vertex property is missing
    #[error("Missing PLY vertex property {0}")]
    MissingProperty(&'static str),

    /// A vertex line could not be parsed
    #[error("Invalid vertex at line {line}: {reason}")]
    InvalidVertex {
        /// One-based line number in the file.
        line: usize,
        /// What went wrong.
        reason: String,
    },

    /// The file ended before all vertices were read
    #[error("Expected {expected} vertices, found {found}")]
    UnexpectedEof {
        /// Vertex count declared in the header.
        expected: usize,
        /// Vertices actually present.
        found: usize,
    },
}
