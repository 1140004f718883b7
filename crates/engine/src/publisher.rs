//! Batch publish
//!
//! Turns a [`TrainedModel`] into the live generation:
//!
//! 1. build the HNSW index over the trained item vectors
//! 2. compare-and-swap the whole model into the factor store
//! 3. save the model artifact, then rotate the update journal
//! 4. notify subscribers (retried with backoff, never fails the publish)
//!
//! Step 2 runs only if step 1 succeeded. A failure in 1 or 2 leaves the
//! previous generation serving and is returned to the caller. A failed save
//! in step 3 is returned as well; the new generation is then live in memory
//! but not on disk, the journal keeps its records and nobody is notified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use latent_core::{GenerationId, LatentError, LatentResult};
use latent_index::{DistanceMetric, HnswConfig, HnswIndex, VectorTable};
use latent_store::{ArtifactStore, FactorStore, NewGeneration};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::trainer::TrainedModel;

// ============================================================================
// Retry Configuration
// ============================================================================

/// Backoff policy for publish notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = try once)
    pub max_retries: usize,
    /// Delay before the first retry in milliseconds, doubled per retry
    pub base_delay_ms: u64,
    /// Cap on a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Try exactly once
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Sent to subscribers after a generation goes live
#[derive(Debug, Clone, PartialEq)]
pub struct PublishEvent {
    /// The new live generation
    pub generation: GenerationId,
    /// Items now served
    pub items: usize,
    /// Users now served
    pub users: usize,
    /// Completion time of the batch run
    pub completion_time: Option<DateTime<Utc>>,
    /// Artifact directory written for this generation, if any
    pub artifact_sequence: Option<u64>,
}

/// Receiver of publish notifications, e.g. serving replicas to reload
pub trait PublishNotifier: Send + Sync {
    /// Deliver one notification
    fn notify(&self, event: &PublishEvent) -> LatentResult<()>;
}

impl<N: PublishNotifier + ?Sized> PublishNotifier for Arc<N> {
    fn notify(&self, event: &PublishEvent) -> LatentResult<()> {
        (**self).notify(event)
    }
}

/// Notifier that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl PublishNotifier for NoopNotifier {
    fn notify(&self, _event: &PublishEvent) -> LatentResult<()> {
        Ok(())
    }
}

/// Retries a notifier with exponential backoff and counts give-ups
pub struct RetryingNotifier<N> {
    inner: N,
    retry: RetryConfig,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl<N: PublishNotifier> RetryingNotifier<N> {
    /// Wrap `inner` with the given policy
    pub fn new(inner: N, retry: RetryConfig) -> Self {
        Self {
            inner,
            retry,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Notifications delivered
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Notifications given up on after all retries
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl<N: PublishNotifier> PublishNotifier for RetryingNotifier<N> {
    fn notify(&self, event: &PublishEvent) -> LatentResult<()> {
        let mut attempt = 0;
        loop {
            match self.inner.notify(event) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        target: "latent::publish",
                        generation = event.generation.as_u64(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish notification failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        target: "latent::publish",
                        generation = event.generation.as_u64(),
                        attempts = attempt + 1,
                        error = %e,
                        "Publish notification abandoned"
                    );
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Outcome of a successful publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    /// The new live generation
    pub generation: GenerationId,
    /// Items now served
    pub items: usize,
    /// Users now served
    pub users: usize,
    /// Artifact directory written, `None` without an artifact store
    pub artifact_sequence: Option<u64>,
    /// Time spent building the index
    pub index_build: Duration,
}

/// Builds, swaps, persists and announces new generations
pub struct Publisher {
    store: Arc<FactorStore>,
    artifacts: Option<ArtifactStore>,
    hnsw: HnswConfig,
    notifier: RwLock<Arc<dyn PublishNotifier>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("artifacts", &self.artifacts)
            .field("hnsw", &self.hnsw)
            .finish()
    }
}

impl Publisher {
    /// Publisher into `store`, saving artifacts when `artifacts` is given
    pub fn new(
        store: Arc<FactorStore>,
        artifacts: Option<ArtifactStore>,
        hnsw: HnswConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            hnsw,
            notifier: RwLock::new(Arc::new(NoopNotifier)),
        }
    }

    /// Replace the notification receiver
    pub fn set_notifier(&self, notifier: Arc<dyn PublishNotifier>) {
        *self.notifier.write() = notifier;
    }

    /// Artifact store, if persistence is enabled
    pub fn artifacts(&self) -> Option<&ArtifactStore> {
        self.artifacts.as_ref()
    }

    /// Build the index for `model` without publishing it
    pub fn build_index(&self, model: &TrainedModel) -> LatentResult<HnswIndex> {
        let dimension = self.store.dimension();
        let table = VectorTable::from_rows(dimension, model.items.iter().map(|i| &i.factor.vector))
            .map_err(|e| LatentError::training(format!("index build failed: {}", e)))?;
        HnswIndex::build(table, DistanceMetric::InnerProduct, self.hnsw)
            .map_err(|e| LatentError::training(format!("index build failed: {}", e)))
    }

    /// Publish `model`, replacing generation `expected`
    pub fn publish(
        &self,
        expected: GenerationId,
        model: TrainedModel,
    ) -> LatentResult<PublishReport> {
        let started = Instant::now();
        let index = match self.build_index(&model) {
            Ok(index) => index,
            Err(e) => {
                error!(
                    target: "latent::publish",
                    expected = expected.as_u64(),
                    error = %e,
                    "Index build failed, keeping live generation"
                );
                return Err(e);
            }
        };
        let index_build = started.elapsed();

        let new = NewGeneration {
            users: model.users,
            items: model.items,
            global: model.global,
            index: Arc::new(index),
        };
        let generation = match self.store.compare_and_swap_all(expected, new) {
            Ok(id) => id,
            Err(e) => {
                error!(
                    target: "latent::publish",
                    expected = expected.as_u64(),
                    error = %e,
                    "Publish rejected, keeping live generation"
                );
                return Err(e);
            }
        };

        let snapshot = self.store.snapshot();
        let artifact_sequence = self.persist(&snapshot)?;

        let event = PublishEvent {
            generation,
            items: snapshot.item_count(),
            users: snapshot.user_count(),
            completion_time: snapshot.global().completion_time,
            artifact_sequence,
        };
        let notifier = self.notifier.read().clone();
        if let Err(e) = notifier.notify(&event) {
            warn!(
                target: "latent::publish",
                generation = generation.as_u64(),
                error = %e,
                "Publish notification not delivered"
            );
        }

        info!(
            target: "latent::publish",
            generation = generation.as_u64(),
            items = event.items,
            users = event.users,
            index_build_ms = index_build.as_millis() as u64,
            artifact = ?artifact_sequence,
            "Model published"
        );
        Ok(PublishReport {
            generation,
            items: event.items,
            users: event.users,
            artifact_sequence,
            index_build,
        })
    }

    /// Save the live generation and rotate the journal.
    ///
    /// The journal is only rotated once the generation it would be replayed
    /// into is on disk.
    fn persist(&self, snapshot: &latent_store::Generation) -> LatentResult<Option<u64>> {
        let saved = match &self.artifacts {
            Some(artifacts) => match artifacts.save(snapshot) {
                Ok(manifest) => Some(manifest.sequence),
                Err(e) => {
                    error!(
                        target: "latent::publish",
                        generation = snapshot.id().as_u64(),
                        error = %e,
                        "Failed to save model artifact, generation is live in memory only"
                    );
                    return Err(e);
                }
            },
            None => None,
        };
        // Records of replaced generations are never replayed, so a failed
        // rotation only costs disk space.
        if let Err(e) = self.store.rotate_journal() {
            warn!(target: "latent::publish", error = %e, "Failed to rotate update journal");
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use latent_core::{GlobalModel, ItemFactor, UserFactor};
    use parking_lot::Mutex;

    use crate::trainer::CorpusStats;

    fn model(items: usize, minute: u32) -> TrainedModel {
        TrainedModel {
            users: vec![UserFactor::new("u1", vec![1.0, 0.0], 0.0)],
            items: (0..items)
                .map(|i| ItemFactor::new(format!("i{}", i), vec![i as f32, 1.0], 0.0))
                .collect(),
            global: GlobalModel::new(3.0, Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()),
            stats: CorpusStats::default(),
            rmse: 0.0,
        }
    }

    struct FlakyNotifier {
        failures_left: Mutex<usize>,
        seen: Mutex<Vec<GenerationId>>,
    }

    impl PublishNotifier for FlakyNotifier {
        fn notify(&self, event: &PublishEvent) -> LatentResult<()> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(LatentError::persistence("endpoint unavailable"));
            }
            self.seen.lock().push(event.generation);
            Ok(())
        }
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let retry = RetryConfig::default();
        let delays: Vec<u64> = (0..5).map(|a| retry.delay_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100]);
        assert_eq!(retry.delay_for(200), Duration::from_millis(100));
    }

    #[test]
    fn test_retrying_notifier_recovers() {
        let flaky = Arc::new(FlakyNotifier {
            failures_left: Mutex::new(2),
            seen: Mutex::new(Vec::new()),
        });
        let notifier =
            RetryingNotifier::new(flaky.clone(), RetryConfig::default().with_base_delay_ms(1));
        let event = PublishEvent {
            generation: GenerationId::new(3),
            items: 1,
            users: 1,
            completion_time: None,
            artifact_sequence: None,
        };
        notifier.notify(&event).unwrap();
        assert_eq!(*flaky.seen.lock(), vec![GenerationId::new(3)]);
        assert_eq!(notifier.delivered(), 1);
        assert_eq!(notifier.failed(), 0);
    }

    #[test]
    fn test_retrying_notifier_gives_up() {
        let flaky = Arc::new(FlakyNotifier {
            failures_left: Mutex::new(10),
            seen: Mutex::new(Vec::new()),
        });
        let notifier = RetryingNotifier::new(
            flaky.clone(),
            RetryConfig::default().with_max_retries(2).with_base_delay_ms(1),
        );
        let event = PublishEvent {
            generation: GenerationId::new(1),
            items: 0,
            users: 0,
            completion_time: None,
            artifact_sequence: None,
        };
        assert!(notifier.notify(&event).is_err());
        assert_eq!(*flaky.failures_left.lock(), 7);
        assert_eq!(notifier.failed(), 1);
    }

    #[test]
    fn test_publish_swaps_and_notifies() {
        let store = Arc::new(FactorStore::new(2).unwrap());
        let publisher = Publisher::new(store.clone(), None, HnswConfig::default());
        let flaky = Arc::new(FlakyNotifier {
            failures_left: Mutex::new(0),
            seen: Mutex::new(Vec::new()),
        });
        publisher.set_notifier(flaky.clone());

        let report = publisher.publish(GenerationId::INITIAL, model(5, 0)).unwrap();
        assert_eq!(report.generation, GenerationId::new(1));
        assert_eq!(report.items, 5);
        assert_eq!(report.artifact_sequence, None);
        assert_eq!(store.snapshot().index().len(), 5);
        assert_eq!(*flaky.seen.lock(), vec![GenerationId::new(1)]);
    }

    #[test]
    fn test_failed_notification_does_not_fail_publish() {
        let store = Arc::new(FactorStore::new(2).unwrap());
        let publisher = Publisher::new(store.clone(), None, HnswConfig::default());
        publisher.set_notifier(Arc::new(RetryingNotifier::new(
            Arc::new(FlakyNotifier {
                failures_left: Mutex::new(100),
                seen: Mutex::new(Vec::new()),
            }),
            RetryConfig::no_retry(),
        )));
        assert!(publisher.publish(GenerationId::INITIAL, model(3, 0)).is_ok());
        assert_eq!(store.generation_id(), GenerationId::new(1));
    }

    #[test]
    fn test_failed_index_build_keeps_live_generation() {
        let store = Arc::new(FactorStore::new(2).unwrap());
        let publisher = Publisher::new(store.clone(), None, HnswConfig::default());
        publisher.publish(GenerationId::INITIAL, model(3, 0)).unwrap();

        let mut bad = model(4, 5);
        bad.items[2].factor.vector[0] = f32::NAN;
        let err = publisher.publish(GenerationId::new(1), bad).unwrap_err();
        assert!(matches!(err, LatentError::TrainingFailure { .. }));
        assert_eq!(store.generation_id(), GenerationId::new(1));
        assert_eq!(store.snapshot().item_count(), 3);
    }

    #[test]
    fn test_stale_expected_generation_conflicts() {
        let store = Arc::new(FactorStore::new(2).unwrap());
        let publisher = Publisher::new(store.clone(), None, HnswConfig::default());
        publisher.publish(GenerationId::INITIAL, model(3, 0)).unwrap();

        let err = publisher.publish(GenerationId::INITIAL, model(6, 5)).unwrap_err();
        assert!(matches!(err, LatentError::PublishConflict { .. }));
        assert_eq!(store.snapshot().item_count(), 3);
    }

    #[test]
    fn test_publish_saves_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FactorStore::new(2).unwrap());
        let artifacts = ArtifactStore::open(dir.path(), 2).unwrap();
        let publisher = Publisher::new(store.clone(), Some(artifacts.clone()), HnswConfig::default());

        let report = publisher.publish(GenerationId::INITIAL, model(4, 0)).unwrap();
        assert_eq!(report.artifact_sequence, Some(1));
        let manifest = artifacts.current_manifest().unwrap().unwrap();
        assert_eq!(manifest.generation, report.generation);
        assert_eq!(manifest.item_count, 4);
    }

    #[test]
    fn test_failed_save_is_returned_and_not_announced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FactorStore::new(2).unwrap());
        let artifacts = ArtifactStore::open(dir.path(), 2).unwrap();
        let publisher = Publisher::new(store.clone(), Some(artifacts.clone()), HnswConfig::default());
        let seen = Arc::new(FlakyNotifier {
            failures_left: Mutex::new(0),
            seen: Mutex::new(Vec::new()),
        });
        publisher.set_notifier(seen.clone());

        // A plain file where the model directories should go.
        std::fs::remove_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models"), b"").unwrap();

        let err = publisher.publish(GenerationId::INITIAL, model(4, 0)).unwrap_err();
        assert!(matches!(err, LatentError::Persistence { .. }), "{:?}", err);
        assert!(artifacts.current_manifest().unwrap().is_none());
        assert!(seen.seen.lock().is_empty());
        // The swap already happened; only the save is missing.
        assert_eq!(store.generation_id(), GenerationId::new(1));
    }
}
