//! Error types for quiver.

use thiserror::Error;

/// Errors that can occur while loading or searching a disk index.
#[derive(Debug, Error)]
pub enum AnnError {
    /// Underlying I/O failure (open, read, metadata).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A required index file is missing or inconsistent with its siblings.
    #[error("load error: {0}")]
    Load(String),

    /// An on-disk structure did not parse.
    #[error("format error: {0}")]
    Format(String),

    /// Dimension mismatch between query and index.
    #[error("dimension mismatch: query has {query_dim} dimensions, index has {index_dim}")]
    DimensionMismatch { query_dim: usize, index_dim: usize },

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Filtered search was asked for a label with no registered medoid.
    #[error("no medoid registered for the requested filter label")]
    FilterNotFound,

    /// Embedding-service protocol failure (connect, frame, decode, size).
    #[error("embedding protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for quiver operations.
pub type Result<T> = std::result::Result<T, AnnError>;
