//! Index error types

use latent_core::LatentError;
use thiserror::Error;

use crate::table::NodeId;

/// Errors raised while building, querying or decoding an index
#[derive(Debug, Error)]
pub enum IndexError {
    /// Query or row dimension doesn't match the table
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Table dimension
        expected: usize,
        /// Dimension of the offending vector
        got: usize,
    },

    /// Invalid dimension specified (must be > 0)
    #[error("Invalid dimension: {dimension} (must be > 0)")]
    InvalidDimension {
        /// The invalid dimension value
        dimension: usize,
    },

    /// Graph parameters out of range
    #[error("Invalid index config: {0}")]
    InvalidConfig(String),

    /// A vector contains NaN or infinity
    #[error("Non-finite component in vector {node}")]
    NonFiniteVector {
        /// Offending row
        node: NodeId,
    },

    /// Encoded index failed validation
    #[error("Format error: {0}")]
    Format(String),

    /// I/O failure while encoding or decoding
    #[error("IO error: {0}")]
    Io(String),
}

impl IndexError {
    /// Check if this error is a validation error
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            IndexError::DimensionMismatch { .. }
                | IndexError::InvalidDimension { .. }
                | IndexError::InvalidConfig(_)
                | IndexError::NonFiniteVector { .. }
        )
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => IndexError::Format("unexpected end of data".into()),
            _ => IndexError::Io(e.to_string()),
        }
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

// =============================================================================
// Conversion to LatentError
// =============================================================================

impl From<IndexError> for LatentError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::DimensionMismatch { expected, got } => {
                LatentError::dimension_mismatch(expected, got)
            }
            IndexError::InvalidDimension { .. } | IndexError::InvalidConfig(_) => {
                LatentError::invalid_input(e.to_string())
            }
            IndexError::NonFiniteVector { .. } => LatentError::training(e.to_string()),
            IndexError::Format(reason) => LatentError::corruption(reason),
            IndexError::Io(reason) => LatentError::persistence(reason),
        }
    }
}
