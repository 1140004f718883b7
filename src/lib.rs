//! latent - matrix-factorization recommendations with online updates
//!
//! latent fits a biased matrix-factorization model to a rating corpus,
//! serves top-k recommendations from an HNSW index over the item vectors,
//! and keeps the model fresh between batch runs with one SGD step per
//! streamed rating.
//!
//! # Quick Start
//!
//! ```ignore
//! use latent::{Engine, RecommendRequest, VecSource, Rating};
//!
//! let engine = Engine::open("/var/lib/latent")?;
//! engine.train_and_publish(&VecSource::new(vec![Rating::new("u1", "i1", 4.0)]))?;
//!
//! let response = engine.recommend(&RecommendRequest::new("u1").with_k(10))?;
//! ```
//!
//! # Architecture
//!
//! All operations go through the [`Engine`]. The building blocks are
//! re-exported as modules for callers that need them directly:
//! [`core`] (types, errors, SGD), [`index`] (HNSW), [`store`]
//! (generations, journal, artifacts).

// Re-export the public API from latent-engine
pub use latent_engine::*;

pub use latent_core as core;
pub use latent_index as index;
pub use latent_store as store;

pub use latent_core::{
    GenerationId, ItemFactor, ItemId, LatentError, LatentResult, Rating, RatingEvent,
    RatingScale, UserFactor, UserId,
};
