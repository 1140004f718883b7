//! Core model types
//!
//! This module defines the foundational types:
//! - UserId / ItemId: Opaque, stable identifiers
//! - Factor: A latent vector plus scalar bias, always replaced together
//! - UserFactor / ItemFactor: A factor keyed by its owner
//! - GlobalModel: Global mean rating and batch completion time
//! - GenerationId: Monotonic identifier of a published model generation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LatentError, LatentResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from any string-like value
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is usable as a model key.
            ///
            /// Empty strings and the placeholder values `"0"` and `"None"`
            /// produced by upstream exports are rejected.
            pub fn is_valid(&self) -> bool {
                !self.0.is_empty() && self.0 != "0" && self.0 != "None"
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque, stable identifier of a user
    UserId
);

string_id!(
    /// Opaque, stable identifier of an item
    ItemId
);

/// Identifier of a published model generation
///
/// Assigned by the factor store, strictly increasing with every publish.
/// Generation 0 is the empty model a store starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId(u64);

impl GenerationId {
    /// The empty generation every store starts from
    pub const INITIAL: GenerationId = GenerationId(0);

    /// Wrap a raw generation number
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw generation number
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The generation that follows this one
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// A latent vector and its scalar bias
///
/// Factors are immutable values: an update produces a new `Factor` which
/// replaces the old one wholesale, so a reader can never observe a vector
/// from one update paired with a bias from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    /// Latent vector (dimension D)
    pub vector: Vec<f32>,
    /// Scalar bias
    pub bias: f32,
}

impl Factor {
    /// Create a factor from a vector and bias
    pub fn new(vector: Vec<f32>, bias: f32) -> Self {
        Self { vector, bias }
    }

    /// All-zero factor of the given dimension
    pub fn zeros(dimension: usize) -> Self {
        Self {
            vector: vec![0.0; dimension],
            bias: 0.0,
        }
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Check the vector has the expected dimension
    pub fn check_dimension(&self, expected: usize) -> LatentResult<()> {
        if self.vector.len() != expected {
            return Err(LatentError::dimension_mismatch(expected, self.vector.len()));
        }
        Ok(())
    }

    /// Whether every component and the bias are finite
    pub fn is_finite(&self) -> bool {
        self.bias.is_finite() && self.vector.iter().all(|v| v.is_finite())
    }
}

/// A user's latent factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFactor {
    /// Owner
    pub id: UserId,
    /// Vector and bias
    pub factor: Factor,
}

impl UserFactor {
    /// Create a user factor
    pub fn new(id: impl Into<UserId>, vector: Vec<f32>, bias: f32) -> Self {
        Self {
            id: id.into(),
            factor: Factor::new(vector, bias),
        }
    }
}

/// An item's latent factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFactor {
    /// Owner
    pub id: ItemId,
    /// Vector and bias
    pub factor: Factor,
}

impl ItemFactor {
    /// Create an item factor
    pub fn new(id: impl Into<ItemId>, vector: Vec<f32>, bias: f32) -> Self {
        Self {
            id: id.into(),
            factor: Factor::new(vector, bias),
        }
    }
}

/// Global model parameters
///
/// Exactly one live instance; replaced wholesale on every batch publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    /// Mean of all ratings in the training corpus
    pub global_mean: f32,
    /// When the batch run that produced this model finished.
    /// `None` for the empty model that exists before the first training run.
    pub completion_time: Option<DateTime<Utc>>,
}

impl GlobalModel {
    /// Model of a completed batch run
    pub fn new(global_mean: f32, completion_time: DateTime<Utc>) -> Self {
        Self {
            global_mean,
            completion_time: Some(completion_time),
        }
    }

    /// The untrained model
    pub fn empty() -> Self {
        Self {
            global_mean: 0.0,
            completion_time: None,
        }
    }

    /// Whether an event at `event_time` is already reflected by this model.
    ///
    /// An event strictly older than the completion time is stale. An event at
    /// exactly the completion time is not. An untrained model never makes an
    /// event stale.
    pub fn is_stale(&self, event_time: DateTime<Utc>) -> bool {
        match self.completion_time {
            Some(completed) => event_time < completed,
            None => false,
        }
    }
}

impl Default for GlobalModel {
    fn default() -> Self {
        Self::empty()
    }
}
