//! Recommendation engine for latent
//!
//! This crate ties the lower layers together:
//! - Engine: open/reload, recommend, ingest, train and publish
//! - BatchTrainer: full SGD fit over the rating corpus
//! - OnlineUpdater: one SGD step per streamed rating, with a staleness guard
//! - Recommender: ANN candidates reranked by bias-adjusted prediction
//! - Publisher: index build, generation swap, artifact save, notification
//! - BackgroundWorkers: scheduled training and reloads
//!
//! The engine is the only component that knows about:
//! - Configuration (`latent.toml`)
//! - The data directory layout
//! - Training run serialization and cancellation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod publisher;
pub mod recommend;
pub mod source;
pub mod trainer;
pub mod updater;

pub use background::{BackgroundWorkers, JobPriority, QueueFull, WorkerStats};
pub use config::{LatentConfig, CONFIG_FILE_NAME};
pub use engine::{Engine, EngineStats, DIR_LOCK_FILE_NAME, JOURNAL_FILE_NAME};
pub use ingest::{parse_event, IngestOutcome, Ingestor};
pub use publisher::{
    NoopNotifier, PublishEvent, PublishNotifier, PublishReport, Publisher, RetryConfig,
    RetryingNotifier,
};
pub use recommend::{
    retrieve_candidates, CandidatePolicy, RecommendRequest, RecommendResponse, Recommendation,
    Recommender,
};
pub use source::{JsonLinesSource, RatingSource, VecSource};
pub use trainer::{
    BatchTrainer, CancellationToken, CorpusStats, TrainedModel, TrainerConfig,
};
pub use updater::{OnlineUpdater, SkipReason, UpdateOutcome, UpdaterStats};
