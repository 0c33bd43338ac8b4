use crate::derivative::ParentId;
use ahash::AHashSet as HashSet;
use parking_lot::RwLock;
use std::sync::Arc;

/// Tracks the parents that currently have a derivative in the store.
///
/// An entry is added after a derivative is written and removed only once
/// the derivative has been deleted (or the parent itself is gone). Only
/// tracked parents are refreshed as group membership changes.
#[derive(Clone, Debug, Default)]
pub struct DerivativeCache(Arc<RwLock<HashSet<ParentId>>>);

impl DerivativeCache {
    /// Adds or refreshes the entry for the parent.
    pub fn insert(&self, id: ParentId) {
        self.0.write().insert(id);
    }

    /// Removes the entry for the parent, returning whether one existed.
    pub fn remove(&self, id: &ParentId) -> bool {
        self.0.write().remove(id)
    }

    pub fn contains(&self, id: &ParentId) -> bool {
        self.0.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
