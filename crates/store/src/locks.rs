//! Per-key row locks
//!
//! Online updates serialize on the rows they touch, never on the whole
//! store. Lock order is always user before item, so two updates sharing a
//! user or an item cannot deadlock.
//!
//! Entries are created on first use and removed again once no writer holds
//! or waits on them, so the table only ever holds keys under contention.

use std::sync::Arc;

use dashmap::DashMap;
use latent_core::{ItemId, UserId};
use parking_lot::Mutex;

/// Key of a lockable row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactorKey {
    /// A user row
    User(UserId),
    /// An item row
    Item(ItemId),
}

/// Lazily populated table of row mutexes
#[derive(Debug, Default)]
pub struct KeyLocks {
    table: DashMap<FactorKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, key: &FactorKey) -> Arc<Mutex<()>> {
        self.table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the entry for `key` if the table holds the only reference.
    ///
    /// Runs under the shard lock, so it cannot race a concurrent `acquire`
    /// of the same key.
    fn release(&self, key: &FactorKey) {
        self.table
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Run `f` while holding the lock of one row
    pub fn with_key<T>(&self, key: FactorKey, f: impl FnOnce() -> T) -> T {
        let mutex = self.acquire(&key);
        let result = {
            let _row = mutex.lock();
            f()
        };
        drop(mutex);
        self.release(&key);
        result
    }

    /// Run `f` while holding the user lock, then the item lock
    pub fn with_pair<T>(&self, user: &UserId, item: &ItemId, f: impl FnOnce() -> T) -> T {
        let user_key = FactorKey::User(user.clone());
        let item_key = FactorKey::Item(item.clone());
        let user_mutex = self.acquire(&user_key);
        let item_mutex = self.acquire(&item_key);
        let result = {
            let _user_row = user_mutex.lock();
            let _item_row = item_mutex.lock();
            f()
        };
        drop(user_mutex);
        drop(item_mutex);
        self.release(&user_key);
        self.release(&item_key);
        result
    }

    /// Number of keys with a lock allocated
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no lock has been allocated
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
