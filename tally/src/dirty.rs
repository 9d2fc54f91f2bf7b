//! The set of entities that may have unflushed deltas.
//!
//! Membership is conservative. An entity with pending deltas is always a
//! member, but a member may have nothing pending. Producers record an
//! increment in the counter store before marking the entity here, so a flush
//! that settles membership after removing the entity always sees that
//! increment.
//!
//! ## Metrics
//!
//! `dirty_entities`: Number of entities currently marked dirty
//!

use metrics::gauge;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::EntityId;

/// Concurrent set of dirty entities.
#[derive(Debug, Default)]
pub struct DirtySet {
    inner: Mutex<FxHashSet<EntityId>>,
}

impl DirtySet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `entity` dirty. Idempotent.
    pub fn mark(&self, entity: &EntityId) {
        let mut inner = self.inner.lock();
        if !inner.contains(entity) {
            inner.insert(entity.clone());
            gauge!("dirty_entities").set(inner.len() as f64);
        }
    }

    /// Remove `entity`, returning whether it was a member.
    pub fn remove(&self, entity: &EntityId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(entity);
        if removed {
            gauge!("dirty_entities").set(inner.len() as f64);
        }
        removed
    }

    /// Point-in-time copy of the members.
    ///
    /// Entities marked after the copy is taken are not included.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EntityId> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Whether `entity` is a member.
    #[must_use]
    pub fn contains(&self, entity: &EntityId) -> bool {
        self.inner.lock().contains(entity)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
