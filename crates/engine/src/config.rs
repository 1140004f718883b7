//! Engine configuration via `latent.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! On first open the engine writes a commented default file into the data
//! directory; edit it and restart to change settings.

use std::path::{Path, PathBuf};

use latent_core::{LatentError, LatentResult, RatingScale, SgdParams};
use latent_index::HnswConfig;
use serde::{Deserialize, Serialize};

use crate::publisher::RetryConfig;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "latent.toml";

/// `[model]`: shape of the factor model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Latent vector dimension D
    pub dimension: usize,
    /// Lowest admissible rating
    pub rating_min: f32,
    /// Highest admissible rating
    pub rating_max: f32,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            dimension: 100,
            rating_min: 1.0,
            rating_max: 5.0,
        }
    }
}

/// `[training]`: batch SGD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// Passes over the corpus
    pub epochs: usize,
    /// SGD step size
    pub learning_rate: f32,
    /// L2 regularization
    pub regularization: f32,
    /// Standard deviation of the initial factor vectors
    pub init_std: f32,
    /// RNG seed for initialisation and shuffling
    pub seed: u64,
    /// Users with this id prefix are trained on but not published.
    /// Empty disables the filter.
    pub excluded_user_prefix: String,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: 30,
            learning_rate: 0.005,
            regularization: 0.02,
            init_std: 0.1,
            seed: 42,
            excluded_user_prefix: "ext_".to_string(),
        }
    }
}

/// `[index]`: HNSW parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    /// Max neighbors per node on upper layers (layer 0 keeps 2M)
    pub m: usize,
    /// Beam width while building
    pub ef_construction: usize,
    /// Default beam width while searching
    pub ef_search: usize,
    /// Seed for level assignment
    pub seed: u64,
}

impl Default for IndexSection {
    fn default() -> Self {
        let hnsw = HnswConfig::default();
        Self {
            m: hnsw.m,
            ef_construction: hnsw.ef_construction,
            ef_search: hnsw.ef_search,
            seed: hnsw.seed,
        }
    }
}

/// `[serving]`: recommendation requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingSection {
    /// k when the request does not give one
    pub default_k: usize,
    /// Candidate pool size for k up to `oversample_threshold`
    pub candidate_pool: usize,
    /// Largest k served from the fixed pool
    pub oversample_threshold: usize,
    /// Pool is `k * oversample` above the threshold
    pub oversample: usize,
}

impl Default for ServingSection {
    fn default() -> Self {
        Self {
            default_k: 20,
            candidate_pool: 250,
            oversample_threshold: 50,
            oversample: 5,
        }
    }
}

/// `[online]`: streaming updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineSection {
    /// SGD step size for a single event
    pub learning_rate: f32,
    /// L2 regularization for a single event
    pub regularization: f32,
}

impl Default for OnlineSection {
    fn default() -> Self {
        let params = SgdParams::default();
        Self {
            learning_rate: params.learning_rate,
            regularization: params.regularization,
        }
    }
}

/// `[publish]`: artifacts, journal and reload notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSection {
    /// Persist published models and journal online updates
    pub persist: bool,
    /// Model directories kept after each save
    pub retain_models: usize,
    /// fsync every journal append
    pub journal_sync: bool,
    /// Notification retry: attempts after the first
    pub max_retries: usize,
    /// Notification retry: first backoff
    pub base_delay_ms: u64,
    /// Notification retry: backoff cap
    pub max_delay_ms: u64,
    /// Background worker threads for scheduled training
    pub worker_threads: usize,
    /// Pending background tasks before submissions are refused
    pub max_queue_depth: usize,
}

impl Default for PublishSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            persist: true,
            retain_models: 3,
            journal_sync: true,
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            worker_threads: 1,
            max_queue_depth: 16,
        }
    }
}

/// Engine configuration loaded from `latent.toml`.
///
/// # Example
///
/// ```toml
/// [model]
/// dimension = 100
///
/// [serving]
/// default_k = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatentConfig {
    /// Factor model shape
    pub model: ModelSection,
    /// Batch training
    pub training: TrainingSection,
    /// ANN index
    pub index: IndexSection,
    /// Recommendation requests
    pub serving: ServingSection,
    /// Streaming updates
    pub online: OnlineSection,
    /// Persistence and notification
    pub publish: PublishSection,
}

impl LatentConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# latent engine configuration

[model]
# Latent vector dimension. Changing it requires retraining.
dimension = 100
rating_min = 1.0
rating_max = 5.0

[training]
epochs = 30
learning_rate = 0.005
regularization = 0.02
init_std = 0.1
seed = 42
# Users with this prefix are trained on but never published ("" = none).
excluded_user_prefix = "ext_"

[index]
m = 16
ef_construction = 64
ef_search = 64
seed = 42

[serving]
default_k = 20
# Candidates fetched from the index before exact reranking.
candidate_pool = 250
# Above this k the pool is k * oversample.
oversample_threshold = 50
oversample = 5

[online]
learning_rate = 0.005
regularization = 0.02

[publish]
# Save published models and journal online updates in the data directory.
persist = true
retain_models = 3
journal_sync = true
# Reload notification retries (exponential backoff).
max_retries = 3
base_delay_ms = 10
max_delay_ms = 100
worker_threads = 1
max_queue_depth = 16
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> LatentResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LatentError::persistence(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: LatentConfig = toml::from_str(&content).map_err(|e| {
            LatentError::invalid_input(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> LatentResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                LatentError::persistence(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> LatentResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| LatentError::serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            LatentError::persistence(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Path of the config file inside a data directory
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE_NAME)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> LatentResult<()> {
        if self.model.dimension == 0 {
            return Err(LatentError::invalid_input("model.dimension must be positive"));
        }
        self.rating_scale()?;
        let t = &self.training;
        if t.epochs == 0 {
            return Err(LatentError::invalid_input("training.epochs must be positive"));
        }
        check_rate("training.learning_rate", t.learning_rate)?;
        check_rate("online.learning_rate", self.online.learning_rate)?;
        if !(t.regularization >= 0.0 && t.regularization.is_finite())
            || !(self.online.regularization >= 0.0 && self.online.regularization.is_finite())
        {
            return Err(LatentError::invalid_input("regularization must be finite and >= 0"));
        }
        if !(t.init_std > 0.0 && t.init_std.is_finite()) {
            return Err(LatentError::invalid_input("training.init_std must be positive"));
        }
        self.hnsw()
            .validate()
            .map_err(|e| LatentError::invalid_input(format!("[index] {}", e)))?;
        let s = &self.serving;
        if s.default_k == 0 || s.candidate_pool == 0 || s.oversample == 0 {
            return Err(LatentError::invalid_input(
                "serving.default_k, candidate_pool and oversample must be positive",
            ));
        }
        if self.publish.worker_threads == 0 || self.publish.max_queue_depth == 0 {
            return Err(LatentError::invalid_input(
                "publish.worker_threads and max_queue_depth must be positive",
            ));
        }
        Ok(())
    }

    /// Admissible rating interval
    pub fn rating_scale(&self) -> LatentResult<RatingScale> {
        RatingScale::new(self.model.rating_min, self.model.rating_max)
    }

    /// Step parameters for the online updater
    pub fn online_params(&self) -> SgdParams {
        SgdParams::new(self.online.learning_rate, self.online.regularization)
    }

    /// HNSW build and search parameters
    pub fn hnsw(&self) -> HnswConfig {
        HnswConfig::new(self.index.m, self.index.ef_construction, self.index.ef_search)
            .with_seed(self.index.seed)
    }

    /// Notification retry policy
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.publish.max_retries,
            base_delay_ms: self.publish.base_delay_ms,
            max_delay_ms: self.publish.max_delay_ms,
        }
    }
}

fn check_rate(name: &str, value: f32) -> LatentResult<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(LatentError::invalid_input(format!(
            "{} must be in (0, 1), got {}",
            name, value
        )));
    }
    Ok(())
}
