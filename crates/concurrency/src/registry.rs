//! Process-wide transaction registry
//!
//! Maps a [`ContextKey`] to the single active [`Transaction`] for that slot.
//! At most one transaction is registered per key at any time.
//!
//! The map is a `DashMap`, so slots belonging to unrelated keys (different
//! threads, resources or creators) never contend on a common lock. All
//! mutation goes through the map's atomic insert/remove operations; the
//! `*_if_*` helpers are the compare-and-swap forms used by the finish path and
//! the run-outside escape hatch.

use crate::transaction::Transaction;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::thread::ThreadId;
use txscope_core::{ContextKey, InstanceId};

/// Registry shared by every coordinator that does not bring its own
static GLOBAL_REGISTRY: Lazy<Arc<TransactionRegistry>> =
    Lazy::new(|| Arc::new(TransactionRegistry::new()));

/// Concurrent map from context key to active transaction
#[derive(Default)]
pub struct TransactionRegistry {
    slots: DashMap<ContextKey, Arc<Transaction>>,
}

impl TransactionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// The process-wide registry
    pub fn global() -> Arc<TransactionRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Transaction registered under `key`, if any
    pub fn lookup(&self, key: &ContextKey) -> Option<Arc<Transaction>> {
        self.slots.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Register `txn` under `key`, returning the previous occupant
    pub fn register(&self, key: ContextKey, txn: Arc<Transaction>) -> Option<Arc<Transaction>> {
        self.slots.insert(key, txn)
    }

    /// Register `txn` under `key` only if the slot is empty
    ///
    /// # Errors
    ///
    /// Returns the current occupant if the slot is taken.
    pub fn insert_if_vacant(
        &self,
        key: ContextKey,
        txn: Arc<Transaction>,
    ) -> Result<(), Arc<Transaction>> {
        match self.slots.entry(key) {
            Entry::Occupied(occupied) => Err(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                vacant.insert(txn);
                Ok(())
            }
        }
    }

    /// Remove whatever is registered under `key`
    pub fn remove(&self, key: &ContextKey) -> Option<Arc<Transaction>> {
        self.slots.remove(key).map(|(_, txn)| txn)
    }

    /// Remove the slot only if it holds the transaction identified by `instance_id`
    ///
    /// Returns true if an entry was removed.
    pub fn remove_if_instance(&self, key: &ContextKey, instance_id: &InstanceId) -> bool {
        self.slots
            .remove_if(key, |_, txn| txn.instance_id() == instance_id)
            .is_some()
    }

    /// Number of registered transactions
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no transaction is registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every transaction registered for `thread`
    pub fn active_for_thread(&self, thread: ThreadId) -> Vec<Arc<Transaction>> {
        self.slots
            .iter()
            .filter(|entry| entry.key().thread() == thread)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("active", &self.slots.len())
            .finish()
    }
}
