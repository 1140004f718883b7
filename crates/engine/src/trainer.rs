//! Batch trainer
//!
//! Fits the biased matrix-factorization model
//!
//! ```text
//! min  sum (r_ui - (mu + b_u + b_i + p_u . q_i))^2
//!      + reg * (|p_u|^2 + |q_i|^2 + b_u^2 + b_i^2)
//! ```
//!
//! by plain SGD over the whole corpus for a fixed number of epochs. The
//! update rule is [`latent_core::math::sgd_step_in_place`], the same
//! arithmetic the online updater applies to single events.
//!
//! Training holds no store lock. The output is a [`TrainedModel`] that the
//! publisher turns into a new generation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use latent_core::math::sgd_step_in_place;
use latent_core::{
    squared_error, Factor, GlobalModel, ItemFactor, ItemId, LatentError, LatentResult, Rating,
    RatingScale, SgdParams, UserFactor, UserId,
};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::LatentConfig;

/// Batch training parameters
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    /// Latent vector dimension
    pub dimension: usize,
    /// Passes over the corpus
    pub epochs: usize,
    /// Step size and regularization
    pub params: SgdParams,
    /// Standard deviation of the initial vectors
    pub init_std: f32,
    /// Seed for initialisation and shuffling
    pub seed: u64,
    /// Users trained on but not published; empty disables
    pub excluded_user_prefix: String,
    /// Admissible ratings
    pub scale: RatingScale,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        let config = LatentConfig::default();
        Self {
            dimension: config.model.dimension,
            epochs: config.training.epochs,
            params: SgdParams::new(config.training.learning_rate, config.training.regularization),
            init_std: config.training.init_std,
            seed: config.training.seed,
            excluded_user_prefix: config.training.excluded_user_prefix,
            scale: RatingScale::default(),
        }
    }
}

impl TrainerConfig {
    /// Training parameters of an engine configuration
    pub fn from_config(config: &LatentConfig) -> LatentResult<Self> {
        Ok(Self {
            dimension: config.model.dimension,
            epochs: config.training.epochs,
            params: SgdParams::new(config.training.learning_rate, config.training.regularization),
            init_std: config.training.init_std,
            seed: config.training.seed,
            excluded_user_prefix: config.training.excluded_user_prefix.clone(),
            scale: config.rating_scale()?,
        })
    }
}

/// Cooperative cancellation of a training run.
///
/// Checked between epochs; a cancelled run returns `TrainingFailure` and
/// its partial output is dropped.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What happened to the raw corpus before training
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusStats {
    /// Rows handed to the trainer
    pub rows_in: usize,
    /// Rows trained on
    pub rows_used: usize,
    /// Rows with an empty or placeholder user/item id
    pub dropped_invalid_id: usize,
    /// Rows with a non-finite or out-of-scale rating
    pub dropped_invalid_rating: usize,
    /// Distinct users trained
    pub users: usize,
    /// Distinct items trained
    pub items: usize,
    /// Users trained but withheld from the published model
    pub excluded_users: usize,
}

/// Output of a successful training run
#[derive(Debug, Clone)]
pub struct TrainedModel {
    /// Published user rows
    pub users: Vec<UserFactor>,
    /// All item rows, in first-seen corpus order
    pub items: Vec<ItemFactor>,
    /// Global mean and completion time
    pub global: GlobalModel,
    /// Corpus cleaning counts
    pub stats: CorpusStats,
    /// Training RMSE after the last epoch
    pub rmse: f32,
}

/// Corpus with ids mapped to dense row numbers
struct Corpus {
    user_ids: Vec<UserId>,
    item_ids: Vec<ItemId>,
    /// (user row, item row, rating)
    triples: Vec<(usize, usize, f32)>,
    stats: CorpusStats,
}

impl Corpus {
    fn build(ratings: &[Rating], scale: &RatingScale) -> Self {
        let mut user_rows: HashMap<&UserId, usize> = HashMap::new();
        let mut item_rows: HashMap<&ItemId, usize> = HashMap::new();
        let mut user_ids = Vec::new();
        let mut item_ids = Vec::new();
        let mut triples = Vec::with_capacity(ratings.len());
        let mut stats = CorpusStats {
            rows_in: ratings.len(),
            ..CorpusStats::default()
        };

        for r in ratings {
            if !r.user_id.is_valid() || !r.item_id.is_valid() {
                stats.dropped_invalid_id += 1;
                continue;
            }
            if !scale.contains(r.rating) {
                stats.dropped_invalid_rating += 1;
                continue;
            }
            let u = *user_rows.entry(&r.user_id).or_insert_with(|| {
                user_ids.push(r.user_id.clone());
                user_ids.len() - 1
            });
            let i = *item_rows.entry(&r.item_id).or_insert_with(|| {
                item_ids.push(r.item_id.clone());
                item_ids.len() - 1
            });
            triples.push((u, i, r.rating));
        }

        stats.rows_used = triples.len();
        stats.users = user_ids.len();
        stats.items = item_ids.len();
        Self {
            user_ids,
            item_ids,
            triples,
            stats,
        }
    }
}

/// Fits the full model from a rating corpus
#[derive(Debug, Clone)]
pub struct BatchTrainer {
    config: TrainerConfig,
}

impl BatchTrainer {
    /// Create a trainer, rejecting unusable parameters
    pub fn new(config: TrainerConfig) -> LatentResult<Self> {
        if config.dimension == 0 || config.epochs == 0 {
            return Err(LatentError::invalid_input(
                "trainer dimension and epochs must be positive",
            ));
        }
        if !(config.init_std > 0.0 && config.init_std.is_finite()) {
            return Err(LatentError::invalid_input("init_std must be positive"));
        }
        Ok(Self { config })
    }

    /// Parameters in use
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train with `completion_time = now()`
    pub fn train(
        &self,
        ratings: &[Rating],
        cancel: &CancellationToken,
    ) -> LatentResult<TrainedModel> {
        self.train_at(ratings, cancel, Utc::now())
    }

    /// Train and stamp the model with a caller-supplied completion time
    pub fn train_at(
        &self,
        ratings: &[Rating],
        cancel: &CancellationToken,
        completed_at: DateTime<Utc>,
    ) -> LatentResult<TrainedModel> {
        let started = Instant::now();
        let corpus = Corpus::build(ratings, &self.config.scale);
        let stats = corpus.stats;
        if stats.dropped_invalid_id + stats.dropped_invalid_rating > 0 {
            warn!(
                target: "latent::trainer",
                invalid_id = stats.dropped_invalid_id,
                invalid_rating = stats.dropped_invalid_rating,
                "Dropped corpus rows"
            );
        }
        if corpus.triples.is_empty() {
            return Err(LatentError::training("corpus has no usable ratings"));
        }

        let global_mean = (corpus.triples.iter().map(|t| t.2 as f64).sum::<f64>()
            / corpus.triples.len() as f64) as f32;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        // Uniform on [-a, a] has standard deviation a / sqrt(3).
        let half_width = self.config.init_std * 3f32.sqrt();
        let init = Uniform::new_inclusive(-half_width, half_width);
        let dim = self.config.dimension;
        let random_factor =
            |rng: &mut StdRng| Factor::new((0..dim).map(|_| init.sample(rng)).collect(), 0.0);
        let mut users: Vec<Factor> = (0..stats.users).map(|_| random_factor(&mut rng)).collect();
        let mut items: Vec<Factor> = (0..stats.items).map(|_| random_factor(&mut rng)).collect();

        info!(
            target: "latent::trainer",
            ratings = stats.rows_used,
            users = stats.users,
            items = stats.items,
            dimension = dim,
            epochs = self.config.epochs,
            global_mean,
            "Training started"
        );

        let mut order: Vec<usize> = (0..corpus.triples.len()).collect();
        let mut rmse = f32::NAN;
        for epoch in 0..self.config.epochs {
            if cancel.is_cancelled() {
                warn!(target: "latent::trainer", epoch, "Training cancelled");
                return Err(LatentError::training(format!(
                    "cancelled before epoch {}",
                    epoch + 1
                )));
            }

            order.shuffle(&mut rng);
            for &n in &order {
                let (u, i, r) = corpus.triples[n];
                sgd_step_in_place(global_mean, &mut users[u], &mut items[i], r, self.config.params);
            }

            rmse = training_rmse(global_mean, &users, &items, &corpus.triples);
            if !rmse.is_finite() {
                return Err(LatentError::training(format!(
                    "training diverged at epoch {} (rmse {})",
                    epoch + 1,
                    rmse
                )));
            }
            debug!(target: "latent::trainer", epoch = epoch + 1, rmse, "Epoch finished");
        }

        if let Some(row) = users.iter().chain(items.iter()).position(|f| !f.is_finite()) {
            return Err(LatentError::training(format!(
                "non-finite parameter in row {}",
                row
            )));
        }

        let prefix = self.config.excluded_user_prefix.as_str();
        let mut excluded = 0usize;
        let users: Vec<UserFactor> = corpus
            .user_ids
            .into_iter()
            .zip(users)
            .filter(|(id, _)| {
                let keep = prefix.is_empty() || !id.as_str().starts_with(prefix);
                if !keep {
                    excluded += 1;
                }
                keep
            })
            .map(|(id, factor)| UserFactor { id, factor })
            .collect();
        let items: Vec<ItemFactor> = corpus
            .item_ids
            .into_iter()
            .zip(items)
            .map(|(id, factor)| ItemFactor { id, factor })
            .collect();

        let stats = CorpusStats {
            excluded_users: excluded,
            ..stats
        };
        info!(
            target: "latent::trainer",
            rmse,
            published_users = users.len(),
            excluded_users = excluded,
            items = items.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Training finished"
        );

        Ok(TrainedModel {
            users,
            items,
            global: GlobalModel::new(global_mean, completed_at),
            stats,
            rmse,
        })
    }
}

fn training_rmse(
    global_mean: f32,
    users: &[Factor],
    items: &[Factor],
    triples: &[(usize, usize, f32)],
) -> f32 {
    let sum: f64 = triples
        .par_iter()
        .map(|&(u, i, r)| squared_error(global_mean, &users[u], &items[i], r) as f64)
        .sum();
    (sum / triples.len() as f64).sqrt() as f32
}
