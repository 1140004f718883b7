//! Factor storage for latent
//!
//! This crate owns the live model:
//! - Generation: user rows, item rows, global model and ANN index published together
//! - FactorStore: lock-free reads, per-key row writes, compare-and-swap publish
//! - KeyLocks: per-user / per-item mutexes for online read-modify-write
//! - UpdateJournal: durable record of online writes, replayed on restart
//! - ArtifactStore: on-disk model directories behind an atomic `CURRENT` pointer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod generation;
pub mod journal;
pub mod locks;
pub mod store;

pub use artifact::{ArtifactManifest, ArtifactStore, LoadedArtifact};
pub use generation::{Generation, ItemRow, NewGeneration};
pub use journal::{FileJournal, JournalRecord, NoopJournal, UpdateJournal};
pub use locks::{FactorKey, KeyLocks};
pub use store::{is_missing, FactorStore, PairView, PairWrite, ReplayStats};
