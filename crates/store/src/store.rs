//! Factor store
//!
//! Holds the live [`Generation`] behind an `ArcSwap`. Readers load the
//! pointer and never block. Writers come in two kinds:
//!
//! - **Row writers** (online updates, user upserts) take the publish gate
//!   shared, then the per-key mutexes of the rows they touch (user before
//!   item), journal the new values, then store them into the row cells.
//! - **Publishers** take the publish gate exclusively, compare the live
//!   generation id with the one they trained against, and swap in a new
//!   generation.
//!
//! Because row writers hold the gate for their whole read-compute-write,
//! no online write can land in a generation after it has been replaced.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use latent_core::{
    EntityKind, Factor, FactorDelta, GenerationId, GlobalModel, ItemFactor, ItemId, LatentError,
    LatentResult, UserFactor, UserId,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::generation::{Generation, NewGeneration};
use crate::journal::{JournalRecord, NoopJournal, UpdateJournal};
use crate::locks::{FactorKey, KeyLocks};

/// Rows handed to an [`FactorStore::update_pair`] closure
#[derive(Debug)]
pub struct PairView<'a> {
    /// Generation the rows belong to
    pub generation: GenerationId,
    /// Global mean and completion time of that generation
    pub global: &'a GlobalModel,
    /// Current user row
    pub user: &'a Factor,
    /// Current item row
    pub item: &'a Factor,
}

/// What an [`FactorStore::update_pair`] closure decided
#[derive(Debug)]
pub enum PairWrite<T> {
    /// Leave both rows untouched
    Skip(T),
    /// Replace both rows
    Write {
        /// New user row
        user: Factor,
        /// New item row
        item: Factor,
        /// Value returned to the caller
        outcome: T,
    },
}

/// Counts from replaying the journal into the live generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records written back into rows
    pub applied: usize,
    /// Records for other generations or rows that no longer exist
    pub skipped: usize,
}

/// Versioned store of user and item factors
pub struct FactorStore {
    current: ArcSwap<Generation>,
    dimension: usize,
    publish_gate: RwLock<()>,
    locks: KeyLocks,
    journal: Arc<dyn UpdateJournal>,
}

impl std::fmt::Debug for FactorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current.load();
        f.debug_struct("FactorStore")
            .field("generation", &current.id())
            .field("dimension", &self.dimension)
            .field("users", &current.user_count())
            .field("items", &current.item_count())
            .finish()
    }
}

impl FactorStore {
    /// Empty store without a journal
    pub fn new(dimension: usize) -> LatentResult<Self> {
        Self::with_journal(dimension, Arc::new(NoopJournal))
    }

    /// Empty store writing online updates to `journal`
    pub fn with_journal(dimension: usize, journal: Arc<dyn UpdateJournal>) -> LatentResult<Self> {
        if dimension == 0 {
            return Err(LatentError::invalid_input("dimension must be positive"));
        }
        Ok(Self {
            current: ArcSwap::from_pointee(Generation::empty(dimension)?),
            dimension,
            publish_gate: RwLock::new(()),
            locks: KeyLocks::new(),
            journal,
        })
    }

    /// Store whose live generation is a previously published model
    pub fn restore(
        dimension: usize,
        id: GenerationId,
        model: NewGeneration,
        journal: Arc<dyn UpdateJournal>,
    ) -> LatentResult<Self> {
        let store = Self::with_journal(dimension, journal)?;
        let generation = Generation::assemble(id, dimension, model)?;
        store.current.store(Arc::new(generation));
        info!(
            target: "latent::store",
            generation = id.as_u64(),
            "Factor store restored"
        );
        Ok(store)
    }

    // ========================================================================
    // Reads (lock-free)
    // ========================================================================

    /// The live generation
    #[inline]
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    /// Identifier of the live generation
    pub fn generation_id(&self) -> GenerationId {
        self.current.load().id()
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current row of a user
    pub fn get_user(&self, id: &UserId) -> Option<UserFactor> {
        self.current.load().user(id).map(|factor| UserFactor {
            id: id.clone(),
            factor: Factor::clone(&factor),
        })
    }

    /// Current row of an item
    pub fn get_item(&self, id: &ItemId) -> Option<ItemFactor> {
        self.current.load().item(id).map(|factor| ItemFactor {
            id: id.clone(),
            factor: Factor::clone(&factor),
        })
    }

    /// Global model of the live generation
    pub fn global_model(&self) -> GlobalModel {
        self.current.load().global().clone()
    }

    // ========================================================================
    // Row writes
    // ========================================================================

    fn check_row(&self, factor: &Factor) -> LatentResult<()> {
        factor.check_dimension(self.dimension)?;
        if !factor.is_finite() {
            return Err(LatentError::invalid_input("factor has non-finite components"));
        }
        Ok(())
    }

    /// Insert or replace a user row in the live generation
    pub fn upsert_user(&self, user: UserFactor) -> LatentResult<()> {
        self.check_row(&user.factor)?;

        let _gate = self.publish_gate.read();
        self.locks.with_key(FactorKey::User(user.id.clone()), || -> LatentResult<()> {
            let generation = self.current.load_full();
            self.journal.append(&JournalRecord::User {
                generation: generation.id(),
                user_id: user.id.clone(),
                factor: user.factor.clone(),
            })?;
            debug!(target: "latent::store", user = %user.id, "User row upserted");
            generation.store_user(&user.id, user.factor);
            Ok(())
        })
    }

    /// Add deltas to a user row and an item row as one update
    pub fn apply_user_item_delta(
        &self,
        user_id: &UserId,
        item_id: &ItemId,
        user_delta: &FactorDelta,
        item_delta: &FactorDelta,
    ) -> LatentResult<()> {
        self.update_pair(user_id, item_id, |view| {
            Ok(PairWrite::Write {
                user: user_delta.apply_to(view.user)?,
                item: item_delta.apply_to(view.item)?,
                outcome: (),
            })
        })
    }

    /// Transactional read-compute-write on one (user, item) pair.
    ///
    /// Under the shared publish gate and the user then item row locks, `f`
    /// sees the current rows and global model and decides whether to write.
    /// A write is journaled before it becomes visible; if the journal
    /// rejects it the rows are left as they were.
    ///
    /// Returns `NotFound` if either row is absent from the live generation.
    pub fn update_pair<T, F>(&self, user_id: &UserId, item_id: &ItemId, f: F) -> LatentResult<T>
    where
        F: FnOnce(PairView<'_>) -> LatentResult<PairWrite<T>>,
    {
        let _gate = self.publish_gate.read();
        self.locks
            .with_pair(user_id, item_id, || self.update_pair_locked(user_id, item_id, f))
    }

    fn update_pair_locked<T, F>(&self, user_id: &UserId, item_id: &ItemId, f: F) -> LatentResult<T>
    where
        F: FnOnce(PairView<'_>) -> LatentResult<PairWrite<T>>,
    {
        let generation = self.current.load_full();
        let user = generation
            .user(user_id)
            .ok_or_else(|| LatentError::user_not_found(user_id))?;
        let item = generation
            .item(item_id)
            .ok_or_else(|| LatentError::item_not_found(item_id))?;

        let decision = f(PairView {
            generation: generation.id(),
            global: generation.global(),
            user: &user,
            item: &item,
        })?;

        match decision {
            PairWrite::Skip(outcome) => Ok(outcome),
            PairWrite::Write {
                user,
                item,
                outcome,
            } => {
                self.check_row(&user)?;
                self.check_row(&item)?;
                self.journal.append(&JournalRecord::Pair {
                    generation: generation.id(),
                    user_id: user_id.clone(),
                    user: user.clone(),
                    item_id: item_id.clone(),
                    item: item.clone(),
                })?;
                generation.store_user(user_id, user);
                generation.store_item(item_id, item);
                Ok(outcome)
            }
        }
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Atomically replace the whole model.
    ///
    /// Succeeds only if `expected` is still the live generation. The new
    /// generation is validated before the gate is taken: item table and
    /// index must hold the same items, all rows must have the store's
    /// dimension, and the completion time must not move backwards.
    /// On any error the live generation is untouched.
    pub fn compare_and_swap_all(
        &self,
        expected: GenerationId,
        new: NewGeneration,
    ) -> LatentResult<GenerationId> {
        self.swap_in(expected, expected.next(), new)
    }

    /// Like [`FactorStore::compare_and_swap_all`], but the new generation
    /// takes the id `target` instead of the next one.
    ///
    /// Used to adopt a saved model under the id it was saved with, so that
    /// journal records written against it replay after a restart. `target`
    /// must be above `expected`.
    pub fn compare_and_swap_to(
        &self,
        expected: GenerationId,
        target: GenerationId,
        new: NewGeneration,
    ) -> LatentResult<GenerationId> {
        if target <= expected {
            return Err(LatentError::invalid_input(format!(
                "generation {} is not newer than {}",
                target.as_u64(),
                expected.as_u64()
            )));
        }
        self.swap_in(expected, target, new)
    }

    fn swap_in(
        &self,
        expected: GenerationId,
        target: GenerationId,
        new: NewGeneration,
    ) -> LatentResult<GenerationId> {
        let completion = new.global.completion_time.ok_or_else(|| {
            LatentError::invalid_input("a published model must carry a completion time")
        })?;
        let generation = Generation::assemble(target, self.dimension, new)?;

        let started = Instant::now();
        let _gate = self.publish_gate.write();
        let live = self.current.load_full();

        if live.id() != expected {
            warn!(
                target: "latent::store",
                expected = expected.as_u64(),
                actual = live.id().as_u64(),
                "Publish lost compare-and-swap"
            );
            return Err(LatentError::PublishConflict {
                expected: expected.as_u64(),
                actual: live.id().as_u64(),
            });
        }
        if let Some(previous) = live.global().completion_time {
            if completion < previous {
                return Err(LatentError::invalid_input(format!(
                    "completion time {} is older than live model's {}",
                    completion, previous
                )));
            }
        }

        let id = target;
        let (users, items) = (generation.user_count(), generation.item_count());
        self.current.store(Arc::new(generation));

        info!(
            target: "latent::store",
            generation = id.as_u64(),
            users,
            items,
            swap_us = started.elapsed().as_micros() as u64,
            "Generation published"
        );
        Ok(id)
    }

    /// Drop journal records that belong to replaced generations
    pub fn rotate_journal(&self) -> LatentResult<()> {
        let _gate = self.publish_gate.write();
        self.journal.rotate(self.current.load().id())
    }

    /// Re-apply journaled writes made against the live generation
    pub fn replay_journal(&self) -> LatentResult<ReplayStats> {
        let records = self.journal.replay()?;
        let _gate = self.publish_gate.write();
        let generation = self.current.load_full();
        let mut stats = ReplayStats::default();

        for record in records {
            if record.generation() != generation.id() {
                stats.skipped += 1;
                continue;
            }
            match record {
                JournalRecord::User {
                    user_id, factor, ..
                } => {
                    if self.check_row(&factor).is_ok() {
                        generation.store_user(&user_id, factor);
                        stats.applied += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                JournalRecord::Pair {
                    user_id,
                    user,
                    item_id,
                    item,
                    ..
                } => {
                    let valid = self.check_row(&user).is_ok() && self.check_row(&item).is_ok();
                    if valid && generation.item_node(&item_id).is_some() {
                        generation.store_user(&user_id, user);
                        generation.store_item(&item_id, item);
                        stats.applied += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
            }
        }

        info!(
            target: "latent::store",
            generation = generation.id().as_u64(),
            applied = stats.applied,
            skipped = stats.skipped,
            "Journal replayed"
        );
        Ok(stats)
    }

    /// Number of row locks currently allocated
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

/// Whether an error from [`FactorStore::update_pair`] names a missing row of `kind`
pub fn is_missing(err: &LatentError, kind: EntityKind) -> bool {
    matches!(err, LatentError::NotFound { entity, .. } if *entity == kind)
}
