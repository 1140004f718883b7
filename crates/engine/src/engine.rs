//! Engine facade
//!
//! [`Engine`] owns one factor store and everything that reads or writes
//! it: the recommender, the online updater, the batch trainer and the
//! publisher. Serving, streaming updates and training all go through here.
//!
//! # Data directory
//!
//! ```text
//! <data_dir>/
//!   .lock            held by the primary engine while it is open
//!   latent.toml      configuration
//!   journal.log      online updates since the last publish
//!   LOCK, CURRENT    artifact store
//!   models/...       published models
//! ```
//!
//! A directory has at most one primary engine ([`Engine::open`]), which owns
//! the journal. Further engines on the same directory, e.g. a trainer next
//! to a server, use [`Engine::open_secondary`]: they may save and reload
//! models but their online updates are not journaled.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use latent_core::{GenerationId, LatentError, LatentResult, RatingEvent, UserFactor, UserId};
use fs2::FileExt;
use latent_store::{
    ArtifactStore, FactorStore, FileJournal, LoadedArtifact, NoopJournal, UpdateJournal,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::background::{BackgroundWorkers, JobPriority, QueueFull, WorkerStats};
use crate::config::LatentConfig;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::publisher::{PublishNotifier, PublishReport, Publisher, RetryingNotifier};
use crate::recommend::{CandidatePolicy, RecommendRequest, RecommendResponse, Recommender};
use crate::source::RatingSource;
use crate::trainer::{BatchTrainer, CancellationToken, TrainerConfig};
use crate::updater::{OnlineUpdater, UpdateOutcome, UpdaterStats};

/// Journal file name inside the data directory
pub const JOURNAL_FILE_NAME: &str = "journal.log";

/// Lock file held by the primary engine of a data directory
pub const DIR_LOCK_FILE_NAME: &str = ".lock";

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStats {
    /// Live generation
    pub generation: GenerationId,
    /// Users in the live generation
    pub users: usize,
    /// Items in the live generation
    pub items: usize,
    /// Completion time of the live model
    pub completion_time: Option<DateTime<Utc>>,
    /// Online updater counters
    pub updates: UpdaterStats,
    /// Ingest payloads discarded as malformed
    pub discarded: u64,
    /// Background queue counters
    pub background: WorkerStats,
}

/// The recommendation engine
pub struct Engine {
    config: LatentConfig,
    data_dir: Option<PathBuf>,
    store: Arc<FactorStore>,
    recommender: Recommender,
    updater: OnlineUpdater,
    ingestor: Ingestor,
    trainer: BatchTrainer,
    publisher: Publisher,
    workers: BackgroundWorkers,
    training: Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
    // Released on drop.
    dir_lock: Option<File>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("primary", &self.dir_lock.is_some())
            .field("generation", &self.store.generation_id())
            .field("workers", &self.workers)
            .finish()
    }
}

impl Engine {
    /// Open the primary engine rooted at `path`.
    ///
    /// Takes an exclusive lock on the directory for the engine's lifetime;
    /// fails with `Persistence` if another engine already holds it. Writes a
    /// default `latent.toml` if none exists, then loads it.
    pub fn open<P: AsRef<Path>>(path: P) -> LatentResult<Arc<Self>> {
        let data_dir = path.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let dir_lock = lock_data_dir(data_dir)?;
        let config_path = LatentConfig::path_in(data_dir);
        LatentConfig::write_default_if_missing(&config_path)?;
        let config = LatentConfig::from_file(&config_path)?;
        Self::build(config, Some(data_dir.to_path_buf()), Some(dir_lock))
    }

    /// Open the primary engine with an explicit configuration.
    ///
    /// The configuration is written to `latent.toml` so a later
    /// [`Engine::open`] on the same directory picks it up.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: LatentConfig,
    ) -> LatentResult<Arc<Self>> {
        let data_dir = path.as_ref();
        config.validate()?;
        std::fs::create_dir_all(data_dir)?;
        let dir_lock = lock_data_dir(data_dir)?;
        config.write_to_file(&LatentConfig::path_in(data_dir))?;
        Self::build(config, Some(data_dir.to_path_buf()), Some(dir_lock))
    }

    /// Open a secondary engine on a directory shared with a primary.
    ///
    /// Takes no directory lock and never touches the journal, so online
    /// updates applied here are lost on restart. Models it publishes are
    /// saved, and [`Engine::reload`] picks up models saved by others.
    /// Uses `latent.toml` if present, defaults otherwise.
    pub fn open_secondary<P: AsRef<Path>>(path: P) -> LatentResult<Arc<Self>> {
        let data_dir = path.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let config_path = LatentConfig::path_in(data_dir);
        let config = if config_path.exists() {
            LatentConfig::from_file(&config_path)?
        } else {
            LatentConfig::default()
        };
        config.validate()?;
        Self::build(config, Some(data_dir.to_path_buf()), None)
    }

    /// Engine with no data directory: nothing is journaled or saved
    pub fn in_memory(config: LatentConfig) -> LatentResult<Arc<Self>> {
        config.validate()?;
        Self::build(config, None, None)
    }

    fn build(
        config: LatentConfig,
        data_dir: Option<PathBuf>,
        dir_lock: Option<File>,
    ) -> LatentResult<Arc<Self>> {
        let dimension = config.model.dimension;
        let persist_dir = data_dir.as_deref().filter(|_| config.publish.persist);
        let primary = dir_lock.is_some();

        let (store, artifacts) = match persist_dir {
            Some(dir) => {
                let artifacts = ArtifactStore::open(dir, config.publish.retain_models)?;
                let journal: Arc<dyn UpdateJournal> = if primary {
                    Arc::new(FileJournal::open(
                        dir.join(JOURNAL_FILE_NAME),
                        config.publish.journal_sync,
                    )?)
                } else {
                    Arc::new(NoopJournal)
                };
                let store = match artifacts.load_current()? {
                    Some(loaded) => {
                        check_dimension(&loaded, dimension)?;
                        FactorStore::restore(
                            dimension,
                            loaded.manifest.generation,
                            loaded.model,
                            journal,
                        )?
                    }
                    None => FactorStore::with_journal(dimension, journal)?,
                };
                if primary {
                    store.replay_journal()?;
                    // Records for generations that were never saved can no
                    // longer be matched to a model.
                    store.rotate_journal()?;
                }
                (Arc::new(store), Some(artifacts))
            }
            None => (Arc::new(FactorStore::new(dimension)?), None),
        };

        let scale = config.rating_scale()?;
        let engine = Self {
            recommender: Recommender::new(CandidatePolicy::from(&config.serving)),
            updater: OnlineUpdater::new(store.clone(), config.online_params(), scale),
            ingestor: Ingestor::new(),
            trainer: BatchTrainer::new(TrainerConfig::from_config(&config)?)?,
            publisher: Publisher::new(store.clone(), artifacts, config.hnsw()),
            workers: BackgroundWorkers::new(
                config.publish.worker_threads,
                config.publish.max_queue_depth,
            )?,
            training: Mutex::new(()),
            cancel: Mutex::new(None),
            dir_lock,
            store,
            data_dir,
            config,
        };

        let snapshot = engine.store.snapshot();
        info!(
            target: "latent::engine",
            data_dir = ?engine.data_dir,
            primary,
            generation = snapshot.id().as_u64(),
            users = snapshot.user_count(),
            items = snapshot.item_count(),
            "Engine opened"
        );
        Ok(Arc::new(engine))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in use
    pub fn config(&self) -> &LatentConfig {
        &self.config
    }

    /// Data directory, `None` for an in-memory engine
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// The factor store
    pub fn store(&self) -> &Arc<FactorStore> {
        &self.store
    }

    /// Whether this engine holds the data directory lock and owns the journal
    pub fn is_primary(&self) -> bool {
        self.dir_lock.is_some()
    }

    /// Live generation id
    pub fn generation(&self) -> GenerationId {
        self.store.generation_id()
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Top items for a user, best first
    pub fn recommend(&self, request: &RecommendRequest) -> LatentResult<RecommendResponse> {
        let k = request.k.unwrap_or(self.config.serving.default_k);
        self.recommend_for(&request.user_id, k)
    }

    /// Top `k` items for `user_id`, best first
    pub fn recommend_for(&self, user_id: &UserId, k: usize) -> LatentResult<RecommendResponse> {
        let generation = self.store.snapshot();
        self.recommender
            .recommend(&generation, user_id, k)
            .map(RecommendResponse::from)
    }

    /// Adopt the saved model in the data directory if it is newer than the
    /// live one. Returns the number of items now served.
    ///
    /// The adopted model keeps the generation id it was saved with, so
    /// updates journaled after the reload replay against it on restart.
    pub fn reload(&self) -> LatentResult<usize> {
        let live = self.store.snapshot();
        let Some(artifacts) = self.publisher.artifacts() else {
            return Ok(live.item_count());
        };
        let Some(loaded) = artifacts.load_current()? else {
            return Ok(live.item_count());
        };
        check_dimension(&loaded, self.store.dimension())?;

        let newer = match (loaded.manifest.completion_time, live.global().completion_time) {
            (Some(saved), Some(current)) => saved > current,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer {
            return Ok(live.item_count());
        }

        let sequence = loaded.manifest.sequence;
        let generation = self.store.compare_and_swap_to(
            live.id(),
            loaded.manifest.generation,
            loaded.model,
        )?;
        self.store.rotate_journal()?;
        let items = self.store.snapshot().item_count();
        info!(
            target: "latent::engine",
            sequence,
            generation = generation.as_u64(),
            items,
            "Reloaded saved model"
        );
        Ok(items)
    }

    /// Queue a [`Engine::reload`] on the background workers
    pub fn schedule_reload(self: &Arc<Self>) -> Result<(), QueueFull> {
        let engine = Arc::downgrade(self);
        self.workers.submit(JobPriority::Reload, "reload", move || {
            if let Some(engine) = engine.upgrade() {
                if let Err(e) = engine.reload() {
                    error!(target: "latent::engine", error = %e, "Scheduled reload failed");
                }
            }
        })
    }

    // ========================================================================
    // Streaming updates
    // ========================================================================

    /// Decode and apply one queue payload
    pub fn ingest(&self, payload: &[u8]) -> LatentResult<IngestOutcome> {
        self.ingestor.ingest(&self.updater, payload)
    }

    /// Apply one decoded event
    pub fn apply_rating(&self, event: &RatingEvent) -> LatentResult<UpdateOutcome> {
        self.updater.apply(event)
    }

    /// Insert or replace one user's row in the live generation
    pub fn upsert_user(&self, user: UserFactor) -> LatentResult<()> {
        self.store.upsert_user(user)
    }

    // ========================================================================
    // Training
    // ========================================================================

    /// Fit a new model from `source` and publish it.
    ///
    /// Runs are serialized. The model replaces the generation that was live
    /// when the run started; if another publish (or a reload) got in first,
    /// the run fails with `PublishConflict` and nothing changes.
    pub fn train_and_publish(&self, source: &dyn RatingSource) -> LatentResult<PublishReport> {
        let _run = self.training.lock();
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        let expected = self.store.generation_id();

        let result = source
            .load()
            .and_then(|ratings| self.trainer.train(&ratings, &token))
            .and_then(|model| self.publisher.publish(expected, model));

        *self.cancel.lock() = None;
        if let Err(e) = &result {
            error!(
                target: "latent::engine",
                expected = expected.as_u64(),
                error = %e,
                "Training run did not publish"
            );
        }
        result
    }

    /// Queue a [`Engine::train_and_publish`] on the background workers
    pub fn schedule_training(
        self: &Arc<Self>,
        source: Arc<dyn RatingSource>,
    ) -> Result<(), QueueFull> {
        let engine = Arc::downgrade(self);
        self.workers
            .submit(JobPriority::Training, "train", move || {
                if let Some(engine) = engine.upgrade() {
                    match engine.train_and_publish(source.as_ref()) {
                        Ok(report) => info!(
                            target: "latent::engine",
                            generation = report.generation.as_u64(),
                            "Scheduled training published"
                        ),
                        Err(e) => warn!(
                            target: "latent::engine",
                            error = %e,
                            "Scheduled training discarded its run"
                        ),
                    }
                }
            })
    }

    /// Abort the running training job, if any. Returns whether one was running.
    pub fn cancel_training(&self) -> bool {
        match self.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Receive a notification after every publish, retried per `[publish]`
    pub fn set_notifier(&self, notifier: Arc<dyn PublishNotifier>) {
        let retrying = RetryingNotifier::new(notifier, self.config.retry());
        self.publisher.set_notifier(Arc::new(retrying));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Current counters
    pub fn stats(&self) -> EngineStats {
        let generation = self.store.snapshot();
        EngineStats {
            generation: generation.id(),
            users: generation.user_count(),
            items: generation.item_count(),
            completion_time: generation.global().completion_time,
            updates: self.updater.stats(),
            discarded: self.ingestor.discarded(),
            background: self.workers.stats(),
        }
    }

    /// Block until queued background jobs have finished
    pub fn wait_for_background(&self) {
        self.workers.wait_idle();
    }

    /// Finish queued background jobs and stop the workers
    pub fn shutdown(&self) {
        self.workers.shutdown();
        info!(
            target: "latent::engine",
            generation = self.store.generation_id().as_u64(),
            "Engine shut down"
        );
    }
}

fn lock_data_dir(dir: &Path) -> LatentResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(DIR_LOCK_FILE_NAME))?;
    file.try_lock_exclusive().map_err(|_| {
        LatentError::persistence(format!(
            "data directory '{}' is already open in another engine",
            dir.display()
        ))
    })?;
    Ok(file)
}

fn check_dimension(loaded: &LoadedArtifact, dimension: usize) -> LatentResult<()> {
    if loaded.manifest.dimension != dimension {
        return Err(LatentError::invalid_input(format!(
            "saved model {} has dimension {}, configured dimension is {}",
            loaded.manifest.sequence, loaded.manifest.dimension, dimension
        )));
    }
    Ok(())
}
