//! Core types for latent
//!
//! This crate defines the foundational types used throughout the system:
//! - UserId / ItemId: Opaque identifiers
//! - Factor / UserFactor / ItemFactor: Latent vectors with biases
//! - GlobalModel: Global mean and batch completion time
//! - GenerationId: Identifier of a published model generation
//! - RatingEvent / Rating / RatingScale: Inputs to the update paths
//! - math: Prediction and the shared SGD update rule
//! - LatentError: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod event;
pub mod math;
pub mod types;

pub use error::{EntityKind, LatentError, LatentResult};
pub use event::{Rating, RatingEvent, RatingScale};
pub use math::{dot, predict, sgd_step, squared_error, FactorDelta, SgdParams, SgdStep};
pub use types::{Factor, GenerationId, GlobalModel, ItemFactor, ItemId, UserFactor, UserId};
