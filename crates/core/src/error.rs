//! Error types for latent
//!
//! This module defines the error taxonomy shared by every crate in the
//! workspace. We use `thiserror` for `Display` and `Error` implementations.
//!
//! A stale rating event is *not* an error: the online updater reports it as a
//! skip outcome. Everything here is something a caller has to react to.

use std::io;
use thiserror::Error;

/// Result type alias for latent operations
pub type LatentResult<T> = std::result::Result<T, LatentError>;

/// Kind of entity a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A user factor row
    User,
    /// An item factor row
    Item,
    /// A persisted model artifact
    Artifact,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Item => write!(f, "item"),
            EntityKind::Artifact => write!(f, "artifact"),
        }
    }
}

/// Error types for latent
///
/// | Variant | Retry? | Description |
/// |---------|--------|-------------|
/// | `NotFound` | no | Unknown user or item vector |
/// | `InvalidInput` | no | Rejected at the boundary (dimension, rating scale, k) |
/// | `TrainingFailure` | no | Batch fit or index build failed; nothing was published |
/// | `PublishConflict` | yes | Another publish won the compare-and-swap |
/// | `Persistence` | yes | Transient journal/artifact I/O failure |
/// | `Corruption` | no | Checksum or format failure in persisted data |
/// | `Serialization` | no | Encode/decode failure |
/// | `Internal` | no | Invariant violation (bug) |
#[derive(Debug, Error)]
pub enum LatentError {
    /// Unknown user or item
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up
        entity: EntityKind,
        /// The identifier that was not found
        id: String,
    },

    /// Input rejected at the boundary
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// Why the input was rejected
        reason: String,
    },

    /// Batch training or index build failed
    #[error("training failed: {reason}")]
    TrainingFailure {
        /// What went wrong
        reason: String,
    },

    /// A concurrent publish won the compare-and-swap
    #[error("publish conflict: expected generation {expected}, live generation is {actual}")]
    PublishConflict {
        /// Generation the publisher expected to replace
        expected: u64,
        /// Generation actually live at publish time
        actual: u64,
    },

    /// Transient persistence failure; the caller should redeliver
    #[error("persistence error: {reason}")]
    Persistence {
        /// Underlying failure
        reason: String,
    },

    /// Persisted data failed validation
    #[error("data corruption: {reason}")]
    Corruption {
        /// What failed to validate
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {reason}")]
    Serialization {
        /// Underlying failure
        reason: String,
    },

    /// Internal invariant violation
    #[error("internal error: {reason}")]
    Internal {
        /// Which invariant broke
        reason: String,
    },
}

impl LatentError {
    /// Unknown user
    pub fn user_not_found(id: impl std::fmt::Display) -> Self {
        LatentError::NotFound {
            entity: EntityKind::User,
            id: id.to_string(),
        }
    }

    /// Unknown item
    pub fn item_not_found(id: impl std::fmt::Display) -> Self {
        LatentError::NotFound {
            entity: EntityKind::Item,
            id: id.to_string(),
        }
    }

    /// Input rejected at the boundary
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        LatentError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Batch training or index build failed
    pub fn training(reason: impl Into<String>) -> Self {
        LatentError::TrainingFailure {
            reason: reason.into(),
        }
    }

    /// Transient persistence failure
    pub fn persistence(reason: impl Into<String>) -> Self {
        LatentError::Persistence {
            reason: reason.into(),
        }
    }

    /// Persisted data failed validation
    pub fn corruption(reason: impl Into<String>) -> Self {
        LatentError::Corruption {
            reason: reason.into(),
        }
    }

    /// Serialization failure
    pub fn serialization(reason: impl Into<String>) -> Self {
        LatentError::Serialization {
            reason: reason.into(),
        }
    }

    /// Internal invariant violation
    pub fn internal(reason: impl Into<String>) -> Self {
        LatentError::Internal {
            reason: reason.into(),
        }
    }

    /// Dimension mismatch between a vector and the model dimension
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        LatentError::invalid_input(format!(
            "dimension mismatch: expected {}, got {}",
            expected, actual
        ))
    }

    /// Whether the operation may succeed if retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatentError::Persistence { .. } | LatentError::PublishConflict { .. }
        )
    }

    /// Whether this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, LatentError::NotFound { .. })
    }
}

impl From<io::Error> for LatentError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData => LatentError::Corruption {
                reason: e.to_string(),
            },
            _ => LatentError::Persistence {
                reason: e.to_string(),
            },
        }
    }
}
