//! Shared test utilities for the integration suites.
//!
//! Import from a suite's main.rs with
//! `#[path = "../common/mod.rs"] mod common;`.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::Path;
use std::sync::{Arc, Once};

use chrono::{DateTime, Duration, TimeZone, Utc};
pub use latent::core::{
    FactorDelta, GenerationId, GlobalModel, ItemFactor, ItemId, LatentError, Rating,
    RatingEvent, UserFactor, UserId,
};
pub use latent::index::{DistanceMetric, HnswConfig, HnswIndex, VectorTable};
pub use latent::store::{FactorStore, NewGeneration};
pub use latent::{Engine, IngestOutcome, LatentConfig, RecommendRequest, VecSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` to enable).
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .try_init();
    });
}

/// Fixed completion time used by hand-built generations
pub fn completed_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

/// An instant strictly after [`completed_at`]
pub fn after_completion(seconds: i64) -> DateTime<Utc> {
    completed_at() + Duration::seconds(seconds)
}

/// Small, fast configuration for engine tests
pub fn small_config(dimension: usize) -> LatentConfig {
    let mut config = LatentConfig::default();
    config.model.dimension = dimension;
    config.training.epochs = 80;
    config.training.learning_rate = 0.05;
    config.training.excluded_user_prefix = String::new();
    config.publish.max_retries = 0;
    config
}

// ============================================================================
// TestEngine - engine on a temporary data directory
// ============================================================================

/// Engine rooted in a temp directory that lives as long as the wrapper
pub struct TestEngine {
    pub engine: Arc<Engine>,
    pub dir: TempDir,
}

impl TestEngine {
    /// Persistent engine with [`small_config`]
    pub fn new(dimension: usize) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = Engine::open_with_config(dir.path(), small_config(dimension))
            .expect("Failed to open test engine");
        TestEngine { engine, dir }
    }

    /// Shut the engine down and open it again on the same directory
    pub fn reopen(self) -> Self {
        let TestEngine { engine, dir } = self;
        engine.shutdown();
        drop(engine);
        let engine = Engine::open(dir.path()).expect("Failed to reopen test engine");
        TestEngine { engine, dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Two taste clusters: even users love even items, odd users love odd items
pub fn clustered_corpus(users: usize, items: usize) -> VecSource {
    let mut ratings = Vec::new();
    for u in 0..users {
        for i in 0..items {
            if (u * 7 + i) % 4 == 0 {
                continue;
            }
            let rating = if u % 2 == i % 2 { 5.0 } else { 1.0 };
            ratings.push(Rating::new(format!("u{}", u), format!("i{}", i), rating));
        }
    }
    VecSource::new(ratings)
}

/// Deterministic random rows in `[-1, 1)`
pub fn random_rows(n: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dimension).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

/// Publish a hand-built model as generation 1 of a fresh in-memory store
pub fn store_with(
    dimension: usize,
    users: Vec<UserFactor>,
    items: Vec<ItemFactor>,
    global_mean: f32,
) -> Arc<FactorStore> {
    let store = FactorStore::new(dimension).unwrap();
    let model = generation_of(users, items, global_mean, completed_at());
    store
        .compare_and_swap_all(GenerationId::INITIAL, model)
        .unwrap();
    Arc::new(store)
}

/// A publishable model with its index built
pub fn generation_of(
    users: Vec<UserFactor>,
    items: Vec<ItemFactor>,
    global_mean: f32,
    completion: DateTime<Utc>,
) -> NewGeneration {
    let dimension = items
        .first()
        .map(|i| i.factor.vector.len())
        .or_else(|| users.first().map(|u| u.factor.vector.len()))
        .unwrap_or(1);
    let table =
        VectorTable::from_rows(dimension, items.iter().map(|i| &i.factor.vector)).unwrap();
    let index =
        HnswIndex::build(table, DistanceMetric::InnerProduct, HnswConfig::default()).unwrap();
    NewGeneration {
        users,
        items,
        global: GlobalModel::new(global_mean, completion),
        index: Arc::new(index),
    }
}

/// JSON payload as it arrives from the rating queue
pub fn payload(user: &str, item: &str, rating: f32, at: DateTime<Utc>) -> Vec<u8> {
    serde_json::json!({
        "user_id": user,
        "item_id": item,
        "rating": rating,
        "timestamp": at.to_rfc3339(),
    })
    .to_string()
    .into_bytes()
}
