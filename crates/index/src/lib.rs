//! Approximate nearest-neighbor index for latent
//!
//! - [`VectorTable`]: contiguous item vectors addressed by dense [`NodeId`]s
//! - [`HnswIndex`]: build-once hierarchical graph, deterministic queries
//! - [`BruteForceIndex`]: exact scan used for ground truth
//! - [`AnnIndex`]: the search interface both implement
//!
//! Scores are always "higher = more similar". The default metric is the
//! raw inner product, matching the interaction term of the rating model.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod brute_force;
pub mod codec;
pub mod distance;
pub mod error;
pub mod hnsw;
pub mod table;

pub use backend::AnnIndex;
pub use brute_force::BruteForceIndex;
pub use codec::{INDEX_FORMAT_VERSION, INDEX_MAGIC};
pub use distance::{compute_similarity, DistanceMetric};
pub use error::{IndexError, IndexResult};
pub use hnsw::{HnswConfig, HnswIndex, Neighbor};
pub use table::{NodeId, VectorTable};
