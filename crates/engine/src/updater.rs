//! Online updater
//!
//! Applies one rating event at a time:
//!
//! ```text
//! Received -> Validated -> StalenessChecked -> Applied
//!                 |               |
//!                 +---------------+--------> Skipped
//! ```
//!
//! - **Validated**: ids and rating are well-formed (else `InvalidInput`),
//!   and both the user and the item exist in the live generation (else
//!   skipped as unknown).
//! - **StalenessChecked**: an event strictly older than the live model's
//!   completion time is already reflected by the batch fit and is skipped.
//! - **Applied**: one SGD step on both rows, read and written under the
//!   store's per-key locks so no concurrent event on the same user or item
//!   can interleave.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use latent_core::{
    sgd_step, squared_error, EntityKind, GenerationId, LatentResult, RatingEvent, RatingScale,
    SgdParams,
};
use latent_store::{is_missing, FactorStore, PairWrite};
use tracing::debug;

/// Why an event did not change the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The user has no vector in the live generation
    UnknownUser,
    /// The item has no vector in the live generation
    UnknownItem,
    /// The event predates the live model's completion time
    Stale,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnknownUser => write!(f, "unknown user"),
            SkipReason::UnknownItem => write!(f, "unknown item"),
            SkipReason::Stale => write!(f, "stale event"),
        }
    }
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// One SGD step was written
    Applied {
        /// Generation the step was written into
        generation: GenerationId,
        /// Squared error before the step
        squared_error_before: f32,
        /// Squared error after the step
        squared_error_after: f32,
    },
    /// Nothing was written
    Skipped(SkipReason),
}

impl UpdateOutcome {
    /// Whether the event changed the model
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// Counters since the updater was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdaterStats {
    /// Events applied
    pub applied: u64,
    /// Events skipped as stale
    pub skipped_stale: u64,
    /// Events skipped for a missing user or item
    pub skipped_unknown: u64,
}

/// Applies single rating events to the factor store
#[derive(Debug)]
pub struct OnlineUpdater {
    store: Arc<FactorStore>,
    params: SgdParams,
    scale: RatingScale,
    applied: AtomicU64,
    skipped_stale: AtomicU64,
    skipped_unknown: AtomicU64,
}

impl OnlineUpdater {
    /// Updater writing into `store`
    pub fn new(store: Arc<FactorStore>, params: SgdParams, scale: RatingScale) -> Self {
        Self {
            store,
            params,
            scale,
            applied: AtomicU64::new(0),
            skipped_stale: AtomicU64::new(0),
            skipped_unknown: AtomicU64::new(0),
        }
    }

    /// Admissible ratings
    pub fn scale(&self) -> &RatingScale {
        &self.scale
    }

    /// Process one event.
    ///
    /// Malformed events are `InvalidInput`; journal failures are
    /// `Persistence` and leave the store untouched.
    pub fn apply(&self, event: &RatingEvent) -> LatentResult<UpdateOutcome> {
        event.validate(&self.scale)?;

        let params = self.params;
        let result = self
            .store
            .update_pair(&event.user_id, &event.item_id, |view| {
                if view.global.is_stale(event.event_time) {
                    return Ok(PairWrite::Skip(UpdateOutcome::Skipped(SkipReason::Stale)));
                }
                let mu = view.global.global_mean;
                let step = sgd_step(mu, view.user, view.item, event.rating, params);
                let after = squared_error(mu, &step.user, &step.item, event.rating);
                Ok(PairWrite::Write {
                    outcome: UpdateOutcome::Applied {
                        generation: view.generation,
                        squared_error_before: step.error * step.error,
                        squared_error_after: after,
                    },
                    user: step.user,
                    item: step.item,
                })
            });

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if is_missing(&e, EntityKind::User) => {
                UpdateOutcome::Skipped(SkipReason::UnknownUser)
            }
            Err(e) if is_missing(&e, EntityKind::Item) => {
                UpdateOutcome::Skipped(SkipReason::UnknownItem)
            }
            Err(e) => return Err(e),
        };

        match &outcome {
            UpdateOutcome::Applied {
                squared_error_before,
                squared_error_after,
                ..
            } => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "latent::updater",
                    user = %event.user_id,
                    item = %event.item_id,
                    before = squared_error_before,
                    after = squared_error_after,
                    "Rating applied"
                );
            }
            UpdateOutcome::Skipped(reason) => {
                match reason {
                    SkipReason::Stale => self.skipped_stale.fetch_add(1, Ordering::Relaxed),
                    _ => self.skipped_unknown.fetch_add(1, Ordering::Relaxed),
                };
                debug!(
                    target: "latent::updater",
                    user = %event.user_id,
                    item = %event.item_id,
                    %reason,
                    "Rating skipped"
                );
            }
        }
        Ok(outcome)
    }

    /// Counters snapshot
    pub fn stats(&self) -> UpdaterStats {
        UpdaterStats {
            applied: self.applied.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
            skipped_unknown: self.skipped_unknown.load(Ordering::Relaxed),
        }
    }
}
